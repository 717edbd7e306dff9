//! Full-collection bootstrap: enqueue the current content of the source
//! collection as synthetic insert events, all stamped with the oplog position
//! captured before the scan started.

use bson::{doc, oid::ObjectId, Document, Timestamp};
use crossbeam::channel;
use mongodb::options::{FindOneOptions, FindOptions};
use mongodb::sync::{Collection, Database};
use rayon::ThreadPoolBuilder;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{id_to_string, ChangeEvent, Operation};
use crate::queue::EventQueue;
use crate::river::gridfs;
use crate::river::oplog::strip_excluded;
use crate::{GRIDFS_FILES_SUFFIX, ID_FIELD};

const LARGE_COLL_SIZE: u64 = 10_000;
const SCAN_BATCH_SIZE: u32 = 1_000;

type IdRange = (ObjectId, Option<ObjectId>);

/// Stream every document of `coll` onto the queue as an insert stamped `ts`.
///
/// Large collections are split into `_id` ranges scanned concurrently; order
/// between bootstrap events does not matter since they share one timestamp
/// and are keyed by document id.
pub fn stream_collection(
    coll: &Collection<Document>,
    queue: &EventQueue,
    ts: Timestamp,
    excludes: &[String],
    concurrent: usize,
) -> Result<u64> {
    let count = coll.count_documents(None, None)?;
    if count <= LARGE_COLL_SIZE || concurrent <= 1 {
        return stream_range(coll, queue, ts, excludes, None);
    }

    let ranges = match split_ranges(coll, count, concurrent)? {
        Some(ranges) if ranges.len() > 1 => ranges,
        _ => {
            debug!("collection cannot be split by _id, scanning serially");
            return stream_range(coll, queue, ts, excludes, None);
        }
    };

    let pool = match ThreadPoolBuilder::new().num_threads(ranges.len()).build() {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "bootstrap pool unavailable, scanning serially");
            return stream_range(coll, queue, ts, excludes, None);
        }
    };

    let (sender, receiver) = channel::bounded(ranges.len());
    let total_ranges = ranges.len();
    for range in ranges {
        let coll = coll.clone();
        let queue = queue.clone();
        let excludes = excludes.to_vec();
        let sender = sender.clone();
        pool.spawn(move || {
            let result = stream_range(&coll, &queue, ts, &excludes, Some(range));
            let _ = sender.send(result);
        });
    }
    drop(sender);

    let mut total = 0;
    for _ in 0..total_ranges {
        total += receiver.recv()??;
    }
    Ok(total)
}

/// Bootstrap a GridFS bucket from its `.files` collection, emitting one
/// attachment event per stored file.
pub fn stream_gridfs_bucket(
    db: &Database,
    bucket: &str,
    queue: &EventQueue,
    ts: Timestamp,
) -> Result<u64> {
    let files = db.collection::<Document>(&format!("{}{}", bucket, GRIDFS_FILES_SUFFIX));
    let cursor = files.find(
        None,
        FindOptions::builder().batch_size(SCAN_BATCH_SIZE).build(),
    )?;
    let mut count = 0;
    for metadata in cursor {
        let metadata = metadata?;
        let id = match metadata.get(ID_FIELD) {
            Some(id) => id.clone(),
            None => continue,
        };
        match gridfs::find_file(db, bucket, &id)? {
            Some(file) => {
                queue.put(ChangeEvent::attachment(ts, Operation::Insert, file))?;
                count += 1;
            }
            None => warn!(id = %id_to_string(&id), "file vanished during bootstrap"),
        }
    }
    Ok(count)
}

fn stream_range(
    coll: &Collection<Document>,
    queue: &EventQueue,
    ts: Timestamp,
    excludes: &[String],
    range: Option<IdRange>,
) -> Result<u64> {
    let filter = range.map(|(lo, hi)| match hi {
        Some(hi) => doc! { ID_FIELD: { "$gte": lo, "$lt": hi } },
        None => doc! { ID_FIELD: { "$gte": lo } },
    });
    let cursor = coll.find(
        filter,
        FindOptions::builder().batch_size(SCAN_BATCH_SIZE).build(),
    )?;
    let mut count = 0;
    for doc in cursor {
        let mut doc = doc?;
        strip_excluded(&mut doc, excludes);
        let id = doc.get(ID_FIELD).map(id_to_string);
        queue.put(ChangeEvent::document(id, ts, Operation::Insert, doc))?;
        count += 1;
    }
    Ok(count)
}

/// Split the collection into `concurrent` half-open `_id` ranges. Returns
/// None when the ids are not ObjectIds, in which case the caller scans
/// serially.
fn split_ranges(
    coll: &Collection<Document>,
    count: u64,
    concurrent: usize,
) -> Result<Option<Vec<IdRange>>> {
    let per_worker = count as usize / concurrent;
    if per_worker == 0 {
        return Ok(None);
    }

    let mut starts = Vec::with_capacity(concurrent);
    for i in 0..concurrent {
        let doc = match coll.find_one(
            None,
            FindOneOptions::builder()
                .sort(doc! { ID_FIELD: 1 })
                .skip((i * per_worker) as u64)
                .build(),
        )? {
            Some(doc) => doc,
            None => break,
        };
        match doc.get_object_id(ID_FIELD) {
            Ok(oid) => starts.push(oid),
            Err(_) => return Ok(None),
        }
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for (i, lo) in starts.iter().enumerate() {
        ranges.push((*lo, starts.get(i + 1).copied()));
    }
    Ok(Some(ranges))
}
