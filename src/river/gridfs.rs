//! Assemble GridFS files from the `<bucket>.files` metadata collection and
//! the ordered `<bucket>.chunks` payload collection.

use bson::{doc, Bson, Document};
use mongodb::options::FindOptions;
use mongodb::sync::Database;

use crate::error::Result;
use crate::event::{id_to_string, GridFsFile};
use crate::{GRIDFS_CHUNKS_SUFFIX, GRIDFS_FILES_SUFFIX, ID_FIELD};

pub fn find_file(db: &Database, bucket: &str, id: &Bson) -> Result<Option<GridFsFile>> {
    let files = db.collection::<Document>(&format!("{}{}", bucket, GRIDFS_FILES_SUFFIX));
    let metadata = match files.find_one(doc! { ID_FIELD: id.clone() }, None)? {
        Some(doc) => doc,
        None => return Ok(None),
    };

    let chunks = db.collection::<Document>(&format!("{}{}", bucket, GRIDFS_CHUNKS_SUFFIX));
    let cursor = chunks.find(
        doc! { "files_id": id.clone() },
        FindOptions::builder().sort(doc! {"n": 1}).build(),
    )?;
    let mut data = Vec::new();
    for chunk in cursor {
        let chunk = chunk?;
        if let Ok(bytes) = chunk.get_binary_generic("data") {
            data.extend_from_slice(bytes);
        }
    }

    Ok(Some(GridFsFile {
        id: id_to_string(id),
        filename: metadata.get_str("filename").unwrap_or_default().to_string(),
        content_type: metadata
            .get_str("contentType")
            .unwrap_or_default()
            .to_string(),
        md5: metadata.get_str("md5").unwrap_or_default().to_string(),
        length: numeric_i64(metadata.get("length")),
        chunk_size: numeric_i64(metadata.get("chunkSize")),
        data,
    }))
}

// GridFS drivers disagree on the numeric width of length and chunkSize.
fn numeric_i64(value: Option<&Bson>) -> i64 {
    match value {
        Some(Bson::Int64(i)) => *i,
        Some(Bson::Int32(i)) => *i as i64,
        Some(Bson::Double(f)) => *f as i64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_i64_widths() {
        assert_eq!(numeric_i64(Some(&Bson::Int64(5))), 5);
        assert_eq!(numeric_i64(Some(&Bson::Int32(5))), 5);
        assert_eq!(numeric_i64(Some(&Bson::Double(5.0))), 5);
        assert_eq!(numeric_i64(Some(&Bson::String("5".to_string()))), 0);
        assert_eq!(numeric_i64(None), 0);
    }
}
