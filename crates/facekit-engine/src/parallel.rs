//! Data-parallel batch recognition.
//!
//! The batch is cut into fixed index ranges; each rayon worker predicts its
//! own range and writes into its own slice of a pre-sized output vector.
//! Workers share only read-only classifier state, so no locking happens
//! inside the fan-out.

use facekit_core::{Classifier, Embedding, IdentityId};
use rayon::prelude::*;

pub struct ParallelRecognitionJob<'a> {
    classifier: &'a Classifier,
    chunk_size: usize,
}

impl<'a> ParallelRecognitionJob<'a> {
    pub fn new(classifier: &'a Classifier, chunk_size: usize) -> Self {
        Self {
            classifier,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Predict every embedding. Output order matches input order; an item
    /// whose prediction fails yields `None` and is logged.
    ///
    /// Runs on the current rayon pool; wrap in `ThreadPool::install` to pick
    /// a dedicated one.
    pub fn run(&self, embeddings: &[Embedding]) -> Vec<Option<IdentityId>> {
        let mut results = vec![None; embeddings.len()];
        let chunk = self.chunk_size;

        results
            .par_chunks_mut(chunk)
            .zip(embeddings.par_chunks(chunk))
            .enumerate()
            .for_each(|(range, (out, items))| {
                for (offset, (slot, embedding)) in out.iter_mut().zip(items).enumerate() {
                    *slot = self.predict_one(range * chunk + offset, embedding);
                }
            });

        tracing::debug!(
            items = embeddings.len(),
            ranges = embeddings.len().div_ceil(chunk),
            matched = results.iter().filter(|r| r.is_some()).count(),
            "recognition batch finished"
        );
        results
    }

    fn predict_one(&self, index: usize, embedding: &Embedding) -> Option<IdentityId> {
        match self.classifier.predict(embedding) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(index, error = %e, "recognition failed for batch item");
                None
            }
        }
    }
}
