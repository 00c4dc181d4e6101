//! Projector slide rendering.
//!
//! Every `core/projector` record names the elements it shows. A registry of
//! slide callables renders them into an artifact that is re-exposed as the
//! synthetic key `projector:<id>`, so clients receive slides like any other
//! element. Callables read other records only through a recording snapshot;
//! the recorded keys decide when a slide must be re-rendered.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::{ChangeBatch, Key};
use crate::datastore::Cache;

/// Collection of the projector records driving the slides.
pub const PROJECTOR_COLLECTION: &str = "core/projector";

/// Synthetic collection under which rendered slides are exposed.
pub const SLIDE_COLLECTION: &str = "projector";

/// One entry of a projector's `elements` list.
#[derive(Clone, Debug, Deserialize)]
pub struct ProjectorElement {
    pub name: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

/// Read-only snapshot capability handed to slide callables.
///
/// Records every key the callable touches so the projector view knows the
/// slide's dependencies.
pub struct SlideContext<'a> {
    cache: &'a Cache,
    reads: RefCell<HashSet<Key>>,
}

impl<'a> SlideContext<'a> {
    fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            reads: RefCell::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(cache: &'a Cache) -> Self {
        Self::new(cache)
    }

    pub fn get(&self, key: &Key) -> Option<Bytes> {
        self.reads.borrow_mut().insert(key.clone());
        self.cache.get(key)
    }

    pub fn get_model(&self, collection: &str, id: u64) -> Option<Bytes> {
        let key = Key::new(collection, id).ok()?;
        self.get(&key)
    }

    fn into_reads(self) -> HashSet<Key> {
        self.reads.into_inner()
    }
}

/// Renders one projector element into slide data.
pub type SlideFn = fn(&SlideContext<'_>, &ProjectorElement) -> Result<Value, SlideError>;

/// Changed synthetic slide keys of one batch.
#[derive(Debug, Default)]
pub struct ProjectorUpdate {
    pub changed: BTreeMap<Key, Option<Bytes>>,
    pub first_err: Option<ProjectorError>,
}

struct ProjectorState {
    rendered: Bytes,
    deps: HashSet<Key>,
}

pub struct Projectors {
    registry: HashMap<&'static str, SlideFn>,
    inner: Mutex<HashMap<u64, ProjectorState>>,
}

impl Projectors {
    pub fn new(registry: HashMap<&'static str, SlideFn>) -> Self {
        Self {
            registry,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn affects(&self, batch: &ChangeBatch) -> bool {
        if batch.touches(PROJECTOR_COLLECTION) {
            return true;
        }
        let inner = self.inner.lock().expect("projector lock");
        batch
            .keys()
            .any(|key| inner.values().any(|state| state.deps.contains(key)))
    }

    /// Re-render what the batch invalidated. The cache has already been
    /// updated; each projector is rendered at most once.
    pub fn update(&self, batch: &ChangeBatch, cache: &Cache) -> ProjectorUpdate {
        let mut out = ProjectorUpdate::default();
        let mut inner = self.inner.lock().expect("projector lock");

        let mut stale: HashSet<u64> = HashSet::new();
        for key in batch.keys() {
            if key.collection() == PROJECTOR_COLLECTION {
                stale.insert(key.id());
                continue;
            }
            for (id, state) in inner.iter() {
                if state.deps.contains(key) {
                    stale.insert(*id);
                }
            }
        }

        for id in stale {
            let record_key = match Key::new(PROJECTOR_COLLECTION, id) {
                Ok(key) => key,
                Err(_) => continue,
            };
            let slide_key = match Key::new(SLIDE_COLLECTION, id) {
                Ok(key) => key,
                Err(_) => continue,
            };

            let Some(record) = cache.get(&record_key) else {
                // Projector deleted: retire its slide.
                if inner.remove(&id).is_some() {
                    out.changed.insert(slide_key, None);
                }
                continue;
            };

            match self.render(cache, &record_key, &record) {
                Ok((rendered, deps)) => {
                    let unchanged = inner
                        .get(&id)
                        .is_some_and(|state| state.rendered == rendered);
                    if !unchanged {
                        out.changed.insert(slide_key, Some(rendered.clone()));
                    }
                    inner.insert(id, ProjectorState { rendered, deps });
                }
                Err(err) => {
                    tracing::warn!("rendering projector {id}: {err}");
                    out.first_err.get_or_insert(err);
                }
            }
        }

        out
    }

    /// Render every projector from scratch. Used by reset and bootstrap.
    pub fn rebuild(&self, cache: &Cache) -> ProjectorUpdate {
        self.inner.lock().expect("projector lock").clear();

        let mut synthetic = ChangeBatch::new(0);
        for (key, _) in cache.collection(PROJECTOR_COLLECTION) {
            synthetic.insert(key, None);
        }
        self.update(&synthetic, cache)
    }

    fn render(
        &self,
        cache: &Cache,
        record_key: &Key,
        record: &Bytes,
    ) -> Result<(Bytes, HashSet<Key>), ProjectorError> {
        #[derive(Deserialize)]
        struct ProjectorRecord {
            #[serde(default)]
            elements: Vec<ProjectorElement>,
        }

        let parsed: ProjectorRecord =
            serde_json::from_slice(record).map_err(|source| ProjectorError::BadRecord {
                key: record_key.to_string(),
                source,
            })?;

        let context = SlideContext::new(cache);
        let mut slides = Vec::with_capacity(parsed.elements.len());
        for element in &parsed.elements {
            let data = match self.registry.get(element.name.as_str()) {
                Some(slide) => match slide(&context, element) {
                    Ok(data) => data,
                    // A broken slide must not take the projector down;
                    // the error renders in place of the slide.
                    Err(err) => json!({"error": err.to_string()}),
                },
                None => json!({"error": format!("unknown slide {}", element.name)}),
            };
            slides.push(json!({"name": element.name, "data": data}));
        }

        let rendered = serde_json::to_vec(&json!({"elements": slides}))
            .map_err(|source| ProjectorError::Encode {
                key: record_key.to_string(),
                source,
            })?;

        let mut deps = context.into_reads();
        deps.insert(record_key.clone());
        Ok((Bytes::from(rendered), deps))
    }
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("undecodable projector record {key}")]
    BadRecord {
        key: String,
        source: serde_json::Error,
    },
    #[error("encoding slide for {key}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SlideError {
    #[error("element names no id")]
    MissingId,
    #[error("{collection}:{id} does not exist")]
    ModelNotFound { collection: &'static str, id: u64 },
    #[error("decoding {collection}:{id}: {source}")]
    BadModel {
        collection: &'static str,
        id: u64,
        source: serde_json::Error,
    },
}
