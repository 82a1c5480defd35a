use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use super::{DataCategory, DataItem, DataTag, QualifiedTag, Value};
use crate::error::{EngineError, Result};

impl Borrow<str> for QualifiedTag {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

fn normalize(tag: &str) -> &str {
    tag.trim().trim_start_matches('/')
}

#[derive(Debug, Clone)]
struct SourceState {
    name: Arc<str>,
    /// Registration order; higher shadows lower on lookup.
    order: u64,
    items: HashMap<QualifiedTag, DataItem>,
}

/// Immutable view of the whole registry at one point in time.
///
/// The render thread loads one of these per tick and reads every bound tag from it, so a
/// tick never sees a half-applied update.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    categories: Arc<BTreeMap<String, DataCategory>>,
    tags: Arc<BTreeMap<QualifiedTag, DataTag>>,
    sources: Arc<BTreeMap<Arc<str>, Arc<SourceState>>>,
    /// Bumped on every publish.
    revision: u64,
}

impl RegistrySnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Resolve a tag across sources; the most recently registered holder wins.
    pub fn get(&self, tag: &str) -> Option<&DataItem> {
        let tag = normalize(tag);
        self.sources
            .values()
            .filter_map(|s| s.items.get(tag).map(|item| (s.order, item)))
            .max_by_key(|(order, _)| *order)
            .map(|(_, item)| item)
    }

    pub fn get_from(&self, source: &str, tag: &str) -> Option<&DataItem> {
        self.sources.get(source)?.items.get(normalize(tag))
    }

    pub fn tag(&self, tag: &str) -> Option<&DataTag> {
        self.tags.get(normalize(tag))
    }

    pub fn iter_tags(&self) -> impl Iterator<Item = &DataTag> {
        self.tags.values()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn category(&self, name: &str) -> Option<&DataCategory> {
        self.categories.get(name)
    }

    /// Categories sorted by their ordering key, then name.
    pub fn categories(&self) -> Vec<&DataCategory> {
        let mut out: Vec<&DataCategory> = self.categories.values().collect();
        out.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        out
    }

    /// Source names in registration order.
    pub fn sources(&self) -> Vec<&str> {
        let mut out: Vec<&SourceState> = self.sources.values().map(|s| s.as_ref()).collect();
        out.sort_by_key(|s| s.order);
        out.into_iter().map(|s| s.name.as_ref()).collect()
    }

    /// Items written by one source, sorted by tag.
    pub fn source_items(&self, source: &str) -> Vec<&DataItem> {
        let Some(state) = self.sources.get(source) else {
            return Vec::new();
        };
        let mut out: Vec<&DataItem> = state.items.values().collect();
        out.sort_by(|a, b| a.tag.cmp(&b.tag));
        out
    }

    fn has_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    fn ensure_category(&mut self, name: &str) {
        if !self.categories.contains_key(name) {
            Arc::make_mut(&mut self.categories).insert(name.to_string(), DataCategory::new(name));
        }
    }

    fn insert_category(&mut self, cat: &DataCategory) -> Result<()> {
        match self.categories.get(&cat.name) {
            Some(existing) if existing == cat => Ok(()),
            Some(_) => Err(EngineError::Configuration(format!(
                "category '{}' is already declared with different attributes",
                cat.name
            ))),
            None => {
                Arc::make_mut(&mut self.categories).insert(cat.name.clone(), cat.clone());
                Ok(())
            }
        }
    }

    fn insert_tag(&mut self, tag: &DataTag) -> Result<QualifiedTag> {
        if let Some(existing) = self.tags.get(tag.qualified.as_str()) {
            if existing.compatible_with(tag) {
                return Ok(existing.qualified.clone());
            }
            return Err(EngineError::Configuration(format!(
                "tag '{}' is already declared as {} (redeclared as {})",
                tag.qualified, existing.kind, tag.kind
            )));
        }
        if let Some(default) = &tag.default {
            if default.kind() != tag.kind {
                return Err(EngineError::TypeMismatch {
                    tag: tag.qualified.to_string(),
                    expected: tag.kind,
                    actual: default.kind(),
                });
            }
        }
        self.ensure_category(tag.category());
        Arc::make_mut(&mut self.tags).insert(tag.qualified.clone(), tag.clone());
        Ok(tag.qualified.clone())
    }

    fn write_item(&mut self, source: &Arc<str>, tag: &str, value: Value) -> Result<()> {
        let Some(decl) = self.tags.get(normalize(tag)) else {
            return Err(EngineError::UnknownTag(normalize(tag).to_string()));
        };
        if decl.kind != value.kind() {
            return Err(EngineError::TypeMismatch {
                tag: decl.qualified.to_string(),
                expected: decl.kind,
                actual: value.kind(),
            });
        }
        let qualified = decl.qualified.clone();

        let sources = Arc::make_mut(&mut self.sources);
        let Some(state) = sources.get_mut(&**source) else {
            return Err(EngineError::UnknownSource(source.to_string()));
        };
        let state = Arc::make_mut(state);
        state.items.insert(
            qualified.clone(),
            DataItem {
                tag: qualified,
                value,
                updated_at: Instant::now(),
                source: Arc::clone(source),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: ArcSwap<RegistrySnapshot>,
    next_order: AtomicU64,
}

impl Shared {
    /// Read-copy-update. `f` may run more than once under contention; an `Err` leaves the
    /// published snapshot untouched.
    fn update<T>(
        &self,
        mut f: impl FnMut(&mut RegistrySnapshot) -> Result<T>,
    ) -> Result<T> {
        let mut outcome: Option<Result<T>> = None;
        self.state.rcu(|cur| {
            let mut next = RegistrySnapshot::clone(cur);
            match f(&mut next) {
                Ok(v) => {
                    outcome = Some(Ok(v));
                    next.revision = cur.revision.wrapping_add(1);
                    Arc::new(next)
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    Arc::clone(cur)
                }
            }
        });
        outcome.unwrap_or_else(|| Err(EngineError::Configuration("registry update did not run".into())))
    }
}

/// Process-wide registry of data sources.
///
/// Cheap to clone; all clones share the same state. Reads never block: they load the current
/// snapshot. Each write publishes a fresh snapshot atomically.
#[derive(Debug, Clone, Default)]
pub struct DataSources {
    shared: Arc<Shared>,
}

impl DataSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&self, name: &str) -> Result<DataSource> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Configuration("data source name is empty".into()));
        }
        let name: Arc<str> = Arc::from(name);
        let order = self.shared.next_order.fetch_add(1, Ordering::Relaxed);
        self.shared.update(|snap| {
            if snap.has_source(&name) {
                return Err(EngineError::DuplicateSource(name.to_string()));
            }
            Arc::make_mut(&mut snap.sources).insert(
                Arc::clone(&name),
                Arc::new(SourceState {
                    name: Arc::clone(&name),
                    order,
                    items: HashMap::new(),
                }),
            );
            Ok(())
        })?;
        crate::logi!("REGISTRY", "registered source '{}'", name);
        Ok(DataSource {
            name,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Remove a source and every item it wrote, in one publish.
    pub fn unregister_source(&self, name: &str) -> Result<()> {
        let removed = self.shared.update(|snap| {
            if !snap.has_source(name) {
                return Err(EngineError::UnknownSource(name.to_string()));
            }
            let state = Arc::make_mut(&mut snap.sources).remove(name);
            Ok(state.map(|s| s.items.len()).unwrap_or(0))
        })?;
        crate::logi!("REGISTRY", "unregistered source '{}' ({} items dropped)", name, removed);
        Ok(())
    }

    pub fn declare_category(&self, category: DataCategory) -> Result<()> {
        if category.name.is_empty() || category.name.contains('/') {
            return Err(EngineError::Configuration(format!(
                "invalid category name '{}'",
                category.name
            )));
        }
        self.shared.update(|snap| snap.insert_category(&category))
    }

    /// Declare a tag. Idempotent for an identical name + type; its category is created on
    /// demand.
    pub fn declare_tag(&self, tag: DataTag) -> Result<QualifiedTag> {
        self.shared.update(|snap| snap.insert_tag(&tag))
    }

    /// Newest value for a tag across all sources.
    pub fn get(&self, tag: &str) -> Option<(Value, Instant)> {
        let snap = self.shared.state.load();
        snap.get(tag).map(|i| (i.value.clone(), i.updated_at))
    }

    pub fn get_from(&self, source: &str, tag: &str) -> Option<(Value, Instant)> {
        let snap = self.shared.state.load();
        snap.get_from(source, tag).map(|i| (i.value.clone(), i.updated_at))
    }

    pub fn tag(&self, tag: &str) -> Option<DataTag> {
        self.shared.state.load().tag(tag).cloned()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.shared.state.load_full()
    }
}

/// Write handle for one registered source.
///
/// `Clone + Send`; the OSC thread and the orchestrator each hold one. Writing through a
/// handle whose source has been unregistered fails with `UnknownSource`.
#[derive(Debug, Clone)]
pub struct DataSource {
    name: Arc<str>,
    shared: Arc<Shared>,
}

impl DataSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_registered(&self) -> bool {
        self.shared.state.load().has_source(&self.name)
    }

    /// Write a value for a declared tag. The value's type must match the declaration.
    pub fn set(&self, tag: &str, value: Value) -> Result<()> {
        self.shared
            .update(|snap| snap.write_item(&self.name, tag, value.clone()))
    }

    /// Like [`DataSource::set`], but declares an unknown tag (and its category) with the
    /// value's type first.
    pub fn set_or_declare(&self, tag: &str, value: Value) -> Result<()> {
        let qualified = QualifiedTag::parse(tag)?;
        self.shared.update(|snap| {
            if snap.tag(qualified.as_str()).is_none() {
                snap.insert_tag(&DataTag::new(qualified.clone(), value.kind()))?;
            }
            snap.write_item(&self.name, qualified.as_str(), value.clone())
        })
    }

    /// This source's own value for a tag.
    pub fn get(&self, tag: &str) -> Option<Value> {
        self.shared
            .state
            .load()
            .get_from(&self.name, tag)
            .map(|i| i.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ValueKind;

    fn float_tag(q: &str) -> DataTag {
        DataTag::new(QualifiedTag::parse(q).unwrap(), ValueKind::Float)
    }

    #[test]
    fn last_write_wins() {
        let reg = DataSources::new();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        let src = reg.register_source("osc:9000").unwrap();

        for v in [0.1, 0.7, 0.3] {
            src.set("synth/level", Value::Float(v)).unwrap();
        }
        let (v, _) = reg.get("synth/level").unwrap();
        assert_eq!(v, Value::Float(0.3));
    }

    #[test]
    fn mistyped_set_keeps_prior_value() {
        let reg = DataSources::new();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        let src = reg.register_source("host").unwrap();
        src.set("synth/level", Value::Float(0.25)).unwrap();

        let err = src
            .set("synth/level", Value::String("loud".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TypeMismatch {
                expected: ValueKind::Float,
                actual: ValueKind::String,
                ..
            }
        ));
        assert_eq!(reg.get("synth/level").unwrap().0, Value::Float(0.25));
    }

    #[test]
    fn undeclared_tag_is_rejected_by_set() {
        let reg = DataSources::new();
        let src = reg.register_source("host").unwrap();
        let err = src.set("synth/nope", Value::Int(1)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTag(t) if t == "synth/nope"));
    }

    #[test]
    fn duplicate_and_empty_source_names_fail() {
        let reg = DataSources::new();
        reg.register_source("host").unwrap();
        assert!(matches!(
            reg.register_source("host"),
            Err(EngineError::DuplicateSource(_))
        ));
        assert!(matches!(
            reg.register_source("  "),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn unregister_removes_only_that_sources_items() {
        let reg = DataSources::new();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        reg.declare_tag(float_tag("audio/gain")).unwrap();
        let a = reg.register_source("a").unwrap();
        let b = reg.register_source("b").unwrap();

        a.set("synth/level", Value::Float(1.0)).unwrap();
        a.set("audio/gain", Value::Float(2.0)).unwrap();
        b.set("synth/level", Value::Float(3.0)).unwrap();

        reg.unregister_source("b").unwrap();

        assert_eq!(reg.get("synth/level").unwrap().0, Value::Float(1.0));
        assert_eq!(reg.get("audio/gain").unwrap().0, Value::Float(2.0));
        assert!(reg.get_from("b", "synth/level").is_none());
        assert!(!b.is_registered());
        assert!(matches!(
            b.set("synth/level", Value::Float(4.0)),
            Err(EngineError::UnknownSource(_))
        ));
    }

    #[test]
    fn later_source_shadows_but_both_stay_addressable() {
        let reg = DataSources::new();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        let defaults = reg.register_source("internal:defaults").unwrap();
        let osc = reg.register_source("osc:9000").unwrap();

        osc.set("synth/level", Value::Float(0.9)).unwrap();
        defaults.set("synth/level", Value::Float(0.1)).unwrap();

        assert_eq!(reg.get("synth/level").unwrap().0, Value::Float(0.9));
        assert_eq!(
            reg.get_from("internal:defaults", "synth/level").unwrap().0,
            Value::Float(0.1)
        );
        assert_eq!(reg.snapshot().sources(), vec!["internal:defaults", "osc:9000"]);
    }

    #[test]
    fn redeclare_with_other_type_fails_but_identical_is_fine() {
        let reg = DataSources::new();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        let err = reg
            .declare_tag(DataTag::new(
                QualifiedTag::parse("synth/level").unwrap(),
                ValueKind::Int,
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(reg.snapshot().category("synth").is_some());
    }

    #[test]
    fn set_or_declare_creates_tag_from_value_kind() {
        let reg = DataSources::new();
        let osc = reg.register_source("osc:9000").unwrap();
        osc.set_or_declare("/fx/mode", Value::Int(3)).unwrap();

        let snap = reg.snapshot();
        assert_eq!(snap.tag("fx/mode").unwrap().kind, ValueKind::Int);
        assert_eq!(snap.get("fx/mode").unwrap().value, Value::Int(3));

        // Now declared: later writes are type-checked.
        assert!(osc.set_or_declare("fx/mode", Value::Float(1.0)).is_err());
        assert_eq!(osc.get("fx/mode"), Some(Value::Int(3)));
    }

    #[test]
    fn snapshot_is_stable_while_writes_continue() {
        let reg = DataSources::new();
        reg.declare_tag(float_tag("synth/level")).unwrap();
        let src = reg.register_source("host").unwrap();
        src.set("synth/level", Value::Float(0.1)).unwrap();

        let held = reg.snapshot();
        src.set("synth/level", Value::Float(0.2)).unwrap();

        assert_eq!(held.get("synth/level").unwrap().value, Value::Float(0.1));
        assert!(reg.snapshot().revision() > held.revision());
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let reg = DataSources::new();
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let src = reg.register_source(&format!("writer{t}")).unwrap();
                    for i in 0..50 {
                        src.set_or_declare(&format!("w{t}/v{i}"), Value::Int(i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().unwrap();
        }
        let snap = reg.snapshot();
        assert_eq!(snap.iter_tags().count(), 200);
        for t in 0..4 {
            assert_eq!(snap.source_items(&format!("writer{t}")).len(), 50);
        }
    }
}
