//! User transformation seam applied by the indexer before bulk translation.

use bson::Document;

use crate::error::Result;
use crate::event::Operation;

/// Mutable context handed to a [`Transformer`] for every document event.
///
/// After `apply` returns, the indexer re-reads every field: `ignore` drops
/// the event (the checkpoint still advances), `deleted` overrides the
/// operation to delete, and the remaining options override the configured
/// index, type, parent, routing and document id.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub document: Document,
    pub operation: Operation,
    pub id: Option<String>,
    pub ignore: bool,
    pub deleted: bool,
    pub index: Option<String>,
    pub doc_type: Option<String>,
    pub parent: Option<String>,
    pub routing: Option<String>,
}

impl ScriptContext {
    pub fn new(document: Document, operation: Operation, id: Option<String>) -> ScriptContext {
        ScriptContext {
            document,
            operation,
            id,
            ignore: false,
            deleted: false,
            index: None,
            doc_type: None,
            parent: None,
            routing: None,
        }
    }
}

/// A user supplied document transformation.
///
/// The core does not depend on any particular scripting runtime; adapters
/// implement this trait around whatever engine they embed.
pub trait Transformer: Send + Sync {
    fn apply(&self, ctx: &mut ScriptContext) -> Result<()>;
}

/// Transformer used when no script is configured.
pub struct NoopTransformer;

impl Transformer for NoopTransformer {
    fn apply(&self, _ctx: &mut ScriptContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_noop_keeps_context() {
        let mut ctx = ScriptContext::new(
            doc! {"a": 1},
            Operation::Insert,
            Some("doc-1".to_string()),
        );
        NoopTransformer.apply(&mut ctx).unwrap();
        assert_eq!(ctx.document, doc! {"a": 1});
        assert_eq!(ctx.operation, Operation::Insert);
        assert_eq!(ctx.id.as_deref(), Some("doc-1"));
        assert!(!ctx.ignore);
        assert!(!ctx.deleted);
        assert!(ctx.index.is_none());
    }
}
