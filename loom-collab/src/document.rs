//! Thin layer over the `yrs` document engine.
//!
//! Everything that touches yrs transactions lives here, so the rest of the
//! crate deals only in encoded updates and state vectors.
//!
//! Remote merges run inside a transaction tagged with a caller-supplied
//! [`Origin`]. Update observers registered through
//! [`observe_local_updates`] skip transactions carrying that origin, which
//! is how replicas avoid re-publishing what they just received.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::protocol::{ProtocolError, SyncMessage};

/// Document engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Update or state vector bytes could not be decoded
    Decode(String),
    /// Decoded update was rejected when applied
    Apply(String),
    /// Observer registration failed
    Observe(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Decode(e) => write!(f, "Decode error: {e}"),
            DocumentError::Apply(e) => write!(f, "Apply error: {e}"),
            DocumentError::Observe(e) => write!(f, "Observer error: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

impl From<DocumentError> for ProtocolError {
    fn from(e: DocumentError) -> Self {
        ProtocolError::Document(e.to_string())
    }
}

/// v1 encoding of an update carrying no changes.
pub const EMPTY_UPDATE: &[u8] = &[0, 0];

/// Build a transaction origin from a label.
pub fn origin(label: &str) -> Origin {
    Origin::from(label)
}

/// Full document state as a single update.
pub fn encode_state_as_update(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Compact summary of what this replica has seen.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    doc.transact().state_vector().encode_v1()
}

/// Update containing everything the remote state vector is missing.
pub fn encode_diff(doc: &Doc, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
    let sv = StateVector::decode_v1(remote_state_vector)
        .map_err(|e| DocumentError::Decode(e.to_string()))?;
    Ok(doc.transact().encode_diff_v1(&sv))
}

/// True when no client has ever written to the document.
pub fn is_empty(doc: &Doc) -> bool {
    doc.transact().state_vector() == StateVector::default()
}

/// Merge one encoded update.
pub fn apply_update(doc: &Doc, update: &[u8], origin: Option<&Origin>) -> Result<(), DocumentError> {
    let update = Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
    let mut txn = match origin {
        Some(origin) => doc.transact_mut_with(origin.clone()),
        None => doc.transact_mut(),
    };
    txn.apply_update(update)
        .map_err(|e| DocumentError::Apply(e.to_string()))
}

/// Combine several updates into one without a document.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, DocumentError> {
    yrs::merge_updates_v1(updates).map_err(|e| DocumentError::Decode(e.to_string()))
}

/// Merge a batch of updates inside one transaction.
///
/// Entries that fail to decode are skipped and counted; the rest are still
/// applied. Returns the number of skipped entries.
pub fn apply_updates(doc: &Doc, updates: &[Vec<u8>], origin: &Origin) -> Result<usize, DocumentError> {
    let mut skipped = 0;
    let mut txn = doc.transact_mut_with(origin.clone());
    for bytes in updates {
        match Update::decode_v1(bytes) {
            Ok(update) => txn
                .apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?,
            Err(e) => {
                log::warn!("Skipping undecodable update ({} bytes): {e}", bytes.len());
                skipped += 1;
            }
        }
    }
    Ok(skipped)
}

/// Register `f` for every update not produced under `ignored`.
///
/// The callback runs synchronously inside the committing transaction and
/// must not open another transaction on the same document.
pub fn observe_local_updates<F>(doc: &Doc, ignored: Origin, f: F) -> Result<Subscription, DocumentError>
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    doc.observe_update_v1(move |txn, event| {
        if txn.origin() == Some(&ignored) || event.update.as_slice() == EMPTY_UPDATE {
            return;
        }
        f(event.update.clone());
    })
    .map_err(|e| DocumentError::Observe(format!("{e:?}")))
}

/// Register `f` for every update regardless of origin.
pub fn observe_all_updates<F>(doc: &Doc, f: F) -> Result<Subscription, DocumentError>
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    doc.observe_update_v1(move |_txn, event| {
        if event.update.as_slice() != EMPTY_UPDATE {
            f(event.update.clone());
        }
    })
    .map_err(|e| DocumentError::Observe(format!("{e:?}")))
}

/// Apply one sync frame and produce the reply it calls for, if any.
pub fn read_sync_message(
    doc: &Doc,
    message: SyncMessage,
    origin: Option<&Origin>,
) -> Result<Option<SyncMessage>, DocumentError> {
    match message {
        SyncMessage::Step1(sv) => Ok(Some(SyncMessage::Step2(encode_diff(doc, &sv)?))),
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            apply_update(doc, &update, origin)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use yrs::{GetString, Text};

    fn doc_with_text(s: &str) -> Doc {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, s);
        drop(txn);
        doc
    }

    fn read_text(doc: &Doc) -> String {
        let text = doc.get_or_insert_text("content");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_empty_document_detection() {
        assert!(is_empty(&Doc::new()));
        assert!(!is_empty(&doc_with_text("x")));
    }

    #[test]
    fn test_step1_reply_carries_missing_state() {
        let source = doc_with_text("hello");
        let target = Doc::new();

        let step1 = SyncMessage::Step1(encode_state_vector(&target));
        let reply = read_sync_message(&source, step1, None).unwrap();
        let Some(SyncMessage::Step2(update)) = reply else {
            panic!("expected step 2, got {reply:?}");
        };
        assert!(read_sync_message(&target, SyncMessage::Step2(update), None).unwrap().is_none());
        assert_eq!(read_text(&target), "hello");
    }

    #[test]
    fn test_tagged_merge_is_not_observed() {
        let source = doc_with_text("abc");
        let target = Doc::new();
        let remote = origin("remote");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = observe_local_updates(&target, remote.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        apply_update(&target, &encode_state_as_update(&source), Some(&remote)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let text = target.get_or_insert_text("content");
        let mut txn = target.transact_mut();
        text.insert(&mut txn, 3, "d");
        drop(txn);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(read_text(&target), "abcd");
    }

    #[test]
    fn test_batch_skips_garbage_entries() {
        let source = doc_with_text("ok");
        let target = Doc::new();
        let updates = vec![vec![0xFF, 0xFF, 0xFF], encode_state_as_update(&source)];
        let skipped = apply_updates(&target, &updates, &origin("log")).unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(read_text(&target), "ok");
    }

    #[test]
    fn test_merged_updates_carry_every_edit() {
        let source = Doc::new();
        let mut updates = Vec::new();
        for (i, chunk) in ["x", "y", "z"].iter().enumerate() {
            let sv = encode_state_vector(&source);
            let text = source.get_or_insert_text("content");
            text.insert(&mut source.transact_mut(), i as u32, chunk);
            updates.push(encode_diff(&source, &sv).unwrap());
        }
        let merged = merge_updates(&updates).unwrap();
        let target = Doc::new();
        apply_update(&target, &merged, None).unwrap();
        assert_eq!(read_text(&target), "xyz");
        assert!(merge_updates(&[vec![0xFF, 0xFF, 0xFF]]).is_err());
    }

    #[test]
    fn test_bad_state_vector_rejected() {
        let doc = Doc::new();
        assert!(matches!(encode_diff(&doc, &[0xFF, 0xFF]), Err(DocumentError::Decode(_))));
    }
}
