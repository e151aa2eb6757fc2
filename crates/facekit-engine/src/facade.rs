//! Recognition facade: the single entry point for training, recognition and
//! identity bookkeeping.
//!
//! One `parking_lot::Mutex` guards the classifier, the identity cache and the
//! parameter map. Training mutates the classifier under it; recognition holds
//! it across the whole parallel batch, so a batch never observes a half-built
//! tree. Nothing here returns an error: failures are logged and surface as
//! `None`, an empty result, or a zero count.

use crate::config::RecognitionConfig;
use crate::parallel::ParallelRecognitionJob;
use crate::params::{self, ParamChange, ParamValue, Parameters, PARAM_ACCURACY, PARAM_K_NEAREST, PARAM_THRESHOLD};
use crate::store::{Attributes, Extractor, IdentityStore, TrainingDataProvider};
use facekit_core::{
    Classifier, ClassifierMode, ClassifierParams, Embedding, Identity, IdentityId, ATTR_FULL_NAME, ATTR_NAME,
    ATTR_UUID,
};
use image::DynamicImage;
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Attribute keys consulted before any other when matching an identity.
const PRIORITY_KEYS: [&str; 3] = [ATTR_UUID, ATTR_FULL_NAME, ATTR_NAME];

struct FacadeState {
    classifier: Classifier,
    cache: BTreeMap<IdentityId, Identity>,
    parameters: Parameters,
}

pub struct RecognitionFacade {
    store: Arc<dyn IdentityStore>,
    extractor: Option<Arc<dyn Extractor>>,
    config: RecognitionConfig,
    pool: Option<rayon::ThreadPool>,
    /// `None` when the identity store failed at construction. Sticky.
    state: Option<Mutex<FacadeState>>,
}

impl RecognitionFacade {
    /// Load identities and stored training data from `store`.
    ///
    /// If the store cannot list identities the facade starts disabled and
    /// every later call is a logged no-op.
    pub fn new(store: Arc<dyn IdentityStore>, config: RecognitionConfig) -> Self {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("facekit-recognize-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!(error = %e, "recognition pool unavailable; using the global rayon pool");
                None
            }
        };

        let identities = match store.list_identities() {
            Ok(identities) => identities,
            Err(e) => {
                tracing::error!(error = %e, "identity store unavailable; recognition disabled");
                return Self {
                    store,
                    extractor: None,
                    config,
                    pool,
                    state: None,
                };
            }
        };

        let classifier = load_classifier(store.as_ref(), config.mode, config.classifier_params());
        let mut state = FacadeState {
            classifier,
            cache: identities.into_iter().map(|i| (i.id, i)).collect(),
            parameters: Parameters::new(),
        };
        normalize_parameters(&mut state);

        tracing::info!(
            identities = state.cache.len(),
            samples = state.classifier.len(),
            mode = ?state.classifier.mode(),
            "recognition facade ready"
        );

        Self {
            store,
            extractor: None,
            config,
            pool,
            state: Some(Mutex::new(state)),
        }
    }

    /// Attach the face-crop to embedding collaborator used by
    /// [`train`](Self::train) and [`recognize_faces`](Self::recognize_faces).
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    fn lock(&self, op: &'static str) -> Option<MutexGuard<'_, FacadeState>> {
        match &self.state {
            Some(state) => Some(state.lock()),
            None => {
                tracing::warn!(op, "recognition facade disabled");
                None
            }
        }
    }

    fn in_pool<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    // ---- parameters ----

    /// Current parameter map. Recognised keys hold their effective values.
    pub fn parameters(&self) -> Parameters {
        self.lock("parameters")
            .map(|state| state.parameters.clone())
            .unwrap_or_default()
    }

    pub fn set_parameter(&self, name: &str, value: impl Into<ParamValue>) {
        let mut params = Parameters::new();
        params.insert(name.to_string(), value.into());
        self.set_parameters(&params);
    }

    /// Merge `params` into the stored map and apply the first recognised key
    /// in the order `k-nearest`, `threshold`, `accuracy`. Later keys in the
    /// same call are stored but have no effect.
    pub fn set_parameters(&self, params: &Parameters) {
        let Some(mut guard) = self.lock("set_parameters") else {
            return;
        };
        let state = &mut *guard;
        state
            .parameters
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        match params::resolve(params) {
            Ok(Some(ParamChange::KNeighbors(k))) => {
                state.classifier.set_k_neighbors(k);
                tracing::info!(k, "k-nearest updated");
            }
            Ok(Some(ParamChange::Threshold(threshold))) => {
                state.classifier.set_threshold(threshold);
                tracing::info!(threshold, "threshold updated");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "parameter ignored"),
        }
        normalize_parameters(state);
    }

    // ---- identities ----

    /// Every cached identity, ascending by id.
    pub fn all_identities(&self) -> Vec<Identity> {
        self.lock("all_identities")
            .map(|state| state.cache.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn identity(&self, id: IdentityId) -> Option<Identity> {
        self.lock("identity")?.cache.get(&id).cloned()
    }

    /// Best match for `attributes`.
    ///
    /// A `uuid` attribute decides on its own. Otherwise `fullName` is tried,
    /// then `name`, then the remaining keys in key order.
    pub fn find_identity(&self, attributes: &Attributes) -> Option<Identity> {
        let mut guard = self.lock("find_identity")?;
        self.match_attributes(&mut guard, attributes)
    }

    /// First identity whose `key` attribute equals `value`.
    pub fn find_identity_by(&self, key: &str, value: &str) -> Option<Identity> {
        let mut guard = self.lock("find_identity_by")?;
        self.find_by(&mut guard, key, value)
    }

    /// Return the identity matching `attributes`, creating it when none does.
    /// New identities get a random `uuid` unless one is supplied.
    pub fn add_identity(&self, attributes: &Attributes) -> Option<Identity> {
        let mut guard = self.lock("add_identity")?;
        if let Some(existing) = self.match_attributes(&mut guard, attributes) {
            return Some(existing);
        }
        self.create_identity(&mut guard, attributes)
    }

    /// Always create a new identity, even if one with equal attributes exists.
    pub fn add_identity_anonymous(&self, attributes: &Attributes) -> Option<Identity> {
        let mut guard = self.lock("add_identity_anonymous")?;
        self.create_identity(&mut guard, attributes)
    }

    /// Replace the attributes of an identity.
    pub fn edit_identity(&self, id: IdentityId, attributes: &Attributes) -> Option<Identity> {
        let mut guard = self.lock("edit_identity")?;
        match self.store.update_identity(id, attributes) {
            Ok(identity) => {
                guard.cache.insert(id, identity.clone());
                Some(identity)
            }
            Err(e) => {
                tracing::warn!(identity = id, error = %e, "edit identity failed");
                None
            }
        }
    }

    pub fn delete_identity(&self, id: IdentityId) {
        self.delete_identities(&[id]);
    }

    /// Remove identities together with their training data.
    pub fn delete_identities(&self, ids: &[IdentityId]) {
        let Some(mut guard) = self.lock("delete_identities") else {
            return;
        };
        let state = &mut *guard;
        if let Err(e) = self.store.clear_training(ids, "delete identity") {
            tracing::warn!(error = %e, "clearing training of deleted identities failed; nothing deleted");
            return;
        }
        // Training rows are gone from here on; the classifier follows the store.
        self.rebuild(state);
        if let Err(e) = self.store.delete_identities(ids) {
            tracing::warn!(error = %e, "delete identities failed");
            self.refresh_cache(state);
            return;
        }
        for id in ids {
            state.cache.remove(id);
        }
        tracing::info!(count = ids.len(), "identities deleted");
    }

    fn match_attributes(&self, state: &mut FacadeState, attributes: &Attributes) -> Option<Identity> {
        if let Some(uuid) = attributes.get(ATTR_UUID) {
            return self.find_by(state, ATTR_UUID, uuid);
        }
        for key in [ATTR_FULL_NAME, ATTR_NAME] {
            if let Some(found) = attributes.get(key).and_then(|value| self.find_by(state, key, value)) {
                return Some(found);
            }
        }
        attributes
            .iter()
            .filter(|(key, _)| !PRIORITY_KEYS.contains(&key.as_str()))
            .find_map(|(key, value)| self.find_by(state, key, value))
    }

    /// Cache first, then the store.
    fn find_by(&self, state: &mut FacadeState, key: &str, value: &str) -> Option<Identity> {
        if let Some(hit) = state.cache.values().find(|i| i.attribute(key) == Some(value)) {
            return Some(hit.clone());
        }
        match self.store.find_by_attribute(key, value) {
            Ok(Some(identity)) => {
                state.cache.insert(identity.id, identity.clone());
                Some(identity)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "identity lookup failed");
                None
            }
        }
    }

    fn create_identity(&self, state: &mut FacadeState, attributes: &Attributes) -> Option<Identity> {
        let mut attributes = attributes.clone();
        attributes
            .entry(ATTR_UUID.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string());

        match self.store.add_identity(&attributes) {
            Ok(identity) => {
                tracing::info!(identity = identity.id, name = %identity.display_name(), "identity added");
                state.cache.insert(identity.id, identity.clone());
                Some(identity)
            }
            Err(e) => {
                tracing::warn!(error = %e, "add identity failed");
                None
            }
        }
    }

    // ---- training ----

    /// Train every identity from the face crops `provider` returns.
    ///
    /// Returns the number of embeddings added. Identities without images,
    /// crops the extractor rejects and store failures are logged and skipped.
    pub fn train(&self, identities: &[Identity], provider: &dyn TrainingDataProvider, context: &str) -> usize {
        let Some(mut guard) = self.lock("train") else {
            return 0;
        };
        let Some(extractor) = self.extractor.as_deref() else {
            tracing::warn!(context, "no extractor attached; cannot train from images");
            return 0;
        };

        let state = &mut *guard;
        let mut trained = 0;
        for identity in identities {
            let images = match provider.images_for_identity(identity) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(identity = identity.id, error = %e, "no training data");
                    continue;
                }
            };
            let embeddings: Vec<Embedding> = self
                .extract_all(extractor, &images)
                .into_iter()
                .flatten()
                .collect();
            trained += self.train_locked(state, identity.id, embeddings, context);
        }
        self.refresh_cache(state);
        trained
    }

    pub fn train_one(&self, identity: &Identity, provider: &dyn TrainingDataProvider, context: &str) -> usize {
        self.train(std::slice::from_ref(identity), provider, context)
    }

    /// Train one identity from already extracted embeddings. Embeddings whose
    /// dimension differs from the classifier's are dropped.
    pub fn train_embeddings(&self, identity: &Identity, embeddings: &[Embedding], context: &str) -> usize {
        let Some(mut guard) = self.lock("train_embeddings") else {
            return 0;
        };
        let state = &mut *guard;
        let trained = self.train_locked(state, identity.id, embeddings.to_vec(), context);
        self.refresh_cache(state);
        trained
    }

    fn train_locked(
        &self,
        state: &mut FacadeState,
        identity: IdentityId,
        embeddings: Vec<Embedding>,
        context: &str,
    ) -> usize {
        let want = state
            .classifier
            .dim()
            .or_else(|| embeddings.iter().find(|e| e.is_finite()).map(Embedding::dim))
            .unwrap_or(0);

        let mut kept = Vec::with_capacity(embeddings.len());
        for (index, embedding) in embeddings.into_iter().enumerate() {
            if !embedding.is_finite() {
                tracing::warn!(identity, index, "non-finite training embedding dropped");
            } else if want == 0 || embedding.dim() != want {
                tracing::warn!(identity, index, got = embedding.dim(), want, "training embedding dropped");
            } else {
                kept.push(embedding);
            }
        }
        if kept.is_empty() {
            return 0;
        }

        // Train a copy and persist before swapping it in, so a failure on
        // either side leaves both classifier and store unchanged.
        let labels = vec![identity; kept.len()];
        let mut trained = state.classifier.clone();
        if let Err(e) = trained.train(&kept, &labels) {
            tracing::warn!(identity, error = %e, "classifier training failed");
            return 0;
        }
        if let Err(e) = self.store.add_training(identity, &kept, context) {
            tracing::warn!(identity, error = %e, "storing training data failed");
            return 0;
        }
        state.classifier = trained;
        tracing::info!(identity, count = kept.len(), context, "identity trained");
        kept.len()
    }

    // ---- recognition ----

    /// Recognise face crops. Output order matches input; crops that fail
    /// extraction or match nobody yield `None`.
    pub fn recognize_faces(&self, images: &[DynamicImage]) -> Vec<Option<Identity>> {
        if !self.is_enabled() {
            tracing::warn!(op = "recognize_faces", "recognition facade disabled");
            return vec![None; images.len()];
        }
        let Some(extractor) = self.extractor.as_deref() else {
            tracing::warn!("no extractor attached; cannot recognise images");
            return vec![None; images.len()];
        };

        let extracted = self.extract_all(extractor, images);
        let (positions, embeddings): (Vec<usize>, Vec<Embedding>) = extracted
            .into_iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|e| (i, e)))
            .unzip();

        let mut results = vec![None; images.len()];
        for (position, identity) in positions.into_iter().zip(self.recognize_embeddings(&embeddings)) {
            results[position] = identity;
        }
        results
    }

    pub fn recognize_face(&self, image: &DynamicImage) -> Option<Identity> {
        self.recognize_faces(std::slice::from_ref(image)).pop().flatten()
    }

    /// Recognise embeddings in parallel. Output order matches input.
    pub fn recognize_embeddings(&self, embeddings: &[Embedding]) -> Vec<Option<Identity>> {
        let Some(state) = self.lock("recognize_embeddings") else {
            return vec![None; embeddings.len()];
        };
        let classifier = &state.classifier;
        let chunk_size = self.config.chunk_size;
        let ids = self.in_pool(|| ParallelRecognitionJob::new(classifier, chunk_size).run(embeddings));

        ids.into_iter()
            .map(|id| id.and_then(|id| state.cache.get(&id).cloned()))
            .collect()
    }

    pub fn recognize_embedding(&self, embedding: &Embedding) -> Option<Identity> {
        self.recognize_embeddings(std::slice::from_ref(embedding)).pop().flatten()
    }

    fn extract_all(&self, extractor: &dyn Extractor, images: &[DynamicImage]) -> Vec<Option<Embedding>> {
        self.in_pool(|| {
            images
                .par_iter()
                .enumerate()
                .map(|(index, image)| match extractor.extract(image) {
                    Ok(embedding) => Some(embedding),
                    Err(e) => {
                        tracing::warn!(index, error = %e, "face crop skipped");
                        None
                    }
                })
                .collect()
        })
    }

    // ---- clearing ----

    /// Forget the training data of `ids` and rebuild the classifier from what
    /// remains.
    pub fn clear_training(&self, ids: &[IdentityId], context: &str) {
        let Some(mut guard) = self.lock("clear_training") else {
            return;
        };
        let state = &mut *guard;
        if let Err(e) = self.store.clear_training(ids, context) {
            tracing::warn!(error = %e, context, "clearing stored training failed; classifier unchanged");
            return;
        }
        self.rebuild(state);
        self.refresh_cache(state);
        tracing::info!(identities = ids.len(), remaining = state.classifier.len(), context, "training cleared");
    }

    /// Forget all training data.
    pub fn clear_all_training(&self, context: &str) {
        let Some(mut guard) = self.lock("clear_all_training") else {
            return;
        };
        let state = &mut *guard;
        if let Err(e) = self.store.clear_all_training(context) {
            tracing::warn!(error = %e, context, "clearing stored training failed; classifier unchanged");
            return;
        }
        state.classifier = Classifier::empty(state.classifier.mode(), *state.classifier.params());
        self.refresh_cache(state);
        tracing::info!(context, "all training cleared");
    }

    /// Number of training samples the classifier holds.
    pub fn training_size(&self) -> usize {
        self.lock("training_size")
            .map(|state| state.classifier.len())
            .unwrap_or(0)
    }

    fn rebuild(&self, state: &mut FacadeState) {
        state.classifier = load_classifier(
            self.store.as_ref(),
            state.classifier.mode(),
            *state.classifier.params(),
        );
    }

    fn refresh_cache(&self, state: &mut FacadeState) {
        match self.store.list_identities() {
            Ok(identities) => state.cache = identities.into_iter().map(|i| (i.id, i)).collect(),
            Err(e) => tracing::warn!(error = %e, "identity cache not refreshed"),
        }
    }
}

/// Build a classifier from every stored training row. Non-finite rows, and
/// rows whose dimension differs from the first usable row, are skipped.
fn load_classifier(store: &dyn IdentityStore, mode: ClassifierMode, params: ClassifierParams) -> Classifier {
    let mut classifier = Classifier::empty(mode, params);
    let rows = match store.training_data() {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "stored training data unavailable; starting empty");
            return classifier;
        }
    };

    let want = rows.iter().find(|(_, e)| e.is_finite()).map(|(_, e)| e.dim());
    let (samples, labels): (Vec<Embedding>, Vec<IdentityId>) = rows
        .into_iter()
        .filter(|(identity, embedding)| {
            let ok = embedding.is_finite() && Some(embedding.dim()) == want;
            if !ok {
                tracing::warn!(identity = *identity, got = embedding.dim(), "stored embedding skipped");
            }
            ok
        })
        .map(|(identity, embedding)| (embedding, identity))
        .unzip();

    if let Err(e) = classifier.train(&samples, &labels) {
        tracing::warn!(error = %e, "rebuilding classifier failed; starting empty");
    }
    tracing::debug!(samples = classifier.len(), "classifier loaded");
    classifier
}

/// Write the effective k and threshold back into the parameter map.
/// `threshold` and `accuracy` always carry the same value.
fn normalize_parameters(state: &mut FacadeState) {
    let params = state.classifier.params();
    let k = i64::try_from(params.k_neighbors).unwrap_or(i64::MAX);
    let threshold = f64::from(params.threshold);
    state.parameters.insert(PARAM_K_NEAREST.to_string(), ParamValue::Int(k));
    state
        .parameters
        .insert(PARAM_THRESHOLD.to_string(), ParamValue::Float(threshold));
    state
        .parameters
        .insert(PARAM_ACCURACY.to_string(), ParamValue::Float(threshold));
}
