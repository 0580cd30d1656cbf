//! Lazy iteration over continued `action=query` results.

use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::params::ParameterSet;
use crate::request::Request;
use crate::site::{NamespaceSupport, Site};

/// Page-size parameter of the module that drives pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LimitTarget {
    parameter: String,
    ceiling: u64,
}

/// Outcome of moving a page of items into the output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extraction {
    Continue,
    /// The client cap is satisfied; no further request may be sent.
    CapReached,
}

/// Fragments of entities that may continue on the next page.
struct MergeBuffer {
    key: String,
    entries: Vec<(String, Value)>,
}

/// Iterator over the items of a query, submitting one request per batch.
///
/// The cursor owns its [`Request`] and rewrites the limit and continuation
/// parameters between submissions. Once it returns `None` it stays
/// exhausted; build a new cursor to restart.
pub struct QueryCursor<'s> {
    request: Request<'s>,
    result_key: String,
    limit: Option<LimitTarget>,
    namespace_module: Option<(String, NamespaceSupport)>,
    namespace_filter: Option<BTreeSet<i64>>,
    increment: Option<u64>,
    batch: Option<u64>,
    cap: Option<usize>,
    emitted: usize,
    pending: VecDeque<Value>,
    continue_keys: Vec<String>,
    merge: Option<MergeBuffer>,
    finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleRole {
    Generator,
    List,
    Prop,
}

impl<'s> QueryCursor<'s> {
    pub fn new(site: &'s mut Site, mut params: ParameterSet) -> Result<Self> {
        match params.first("action") {
            None => params.set("action", "query"),
            Some("query") => {}
            Some(other) => {
                return Err(Error::Misuse(format!(
                    "cannot iterate action={other}; only queries continue"
                )));
            }
        }
        params.set_default("continue", "");

        let generator = params.first("generator").map(ToString::to_string);
        let candidates = generator
            .iter()
            .map(|name| (name.clone(), ModuleRole::Generator))
            .chain(params.values("list").iter().map(|name| (name.clone(), ModuleRole::List)))
            .chain(params.values("prop").iter().map(|name| (name.clone(), ModuleRole::Prop)))
            .collect::<Vec<_>>();
        let paths = candidates
            .iter()
            .map(|(name, _)| format!("query+{name}"))
            .collect::<Vec<_>>();
        site.load_module_info(&paths)?;

        let high_limits = site.config().site.high_limits;
        let mut limit: Option<LimitTarget> = None;
        let mut namespace_module = None;
        for ((name, role), path) in candidates.iter().zip(&paths) {
            let Some(info) = site.module_info(path)? else {
                tracing::warn!(module = %name, "no metadata for query module; batch size left to the server");
                continue;
            };
            let prefix = match role {
                ModuleRole::Generator => format!("g{}", info.prefix),
                ModuleRole::List | ModuleRole::Prop => info.prefix.clone(),
            };
            if namespace_module.is_none() && *role != ModuleRole::Prop {
                namespace_module = Some((prefix.clone(), info.namespace));
            }
            let Some(limits) = info.limit else {
                continue;
            };
            let parameter = format!("{prefix}limit");
            if limit.is_none() {
                let ceiling = if high_limits { limits.highmax } else { limits.max };
                limit = Some(LimitTarget { parameter, ceiling });
            } else {
                params.set_default(&parameter, "max");
            }
        }

        if let Some(target) = limit.as_mut()
            && params.values("rvprop").iter().any(|prop| prop == "content")
        {
            target.ceiling = (target.ceiling / 10).max(1);
        }
        let increment = limit
            .as_ref()
            .and_then(|target| params.first(&target.parameter))
            .and_then(|value| value.parse::<u64>().ok());

        let result_key = if generator.is_some() || !params.values("prop").is_empty() {
            "pages".to_string()
        } else {
            params
                .first("list")
                .or_else(|| params.first("meta"))
                .unwrap_or("pages")
                .to_string()
        };

        Ok(Self {
            request: Request::new(site, params)?,
            result_key,
            limit,
            namespace_module,
            namespace_filter: None,
            increment,
            batch: None,
            cap: None,
            emitted: 0,
            pending: VecDeque::new(),
            continue_keys: Vec::new(),
            merge: None,
            finished: false,
        })
    }

    /// Cursor that stitches together fragments of the same entity, identified
    /// by the `key` field of each item, that the server split across pages.
    pub fn merging(site: &'s mut Site, params: ParameterSet, key: &str) -> Result<Self> {
        let mut cursor = Self::new(site, params)?;
        cursor.merge = Some(MergeBuffer {
            key: key.to_string(),
            entries: Vec::new(),
        });
        Ok(cursor)
    }

    /// Preferred number of items per request, clamped to the module ceiling.
    pub fn set_query_increment(&mut self, increment: u64) {
        self.increment = Some(increment.max(1));
        self.batch = None;
    }

    pub fn set_maximum_items(&mut self, cap: Option<usize>) {
        self.cap = cap;
    }

    /// Restrict results to `namespaces`, natively when the driving module
    /// supports it and by filtering on each item's `ns` otherwise.
    pub fn set_namespaces(&mut self, namespaces: &[i64]) {
        let unique = namespaces.iter().copied().collect::<BTreeSet<_>>();
        if unique.is_empty() {
            self.namespace_filter = None;
            return;
        }
        let native = match &self.namespace_module {
            Some((prefix, NamespaceSupport::Multi)) => Some(prefix.clone()),
            Some((prefix, NamespaceSupport::Single)) if unique.len() == 1 => Some(prefix.clone()),
            _ => None,
        };
        match native {
            Some(prefix) => {
                let values = unique.iter().copied().collect::<Vec<_>>();
                self.request
                    .params_mut()
                    .set(format!("{prefix}namespace"), values);
                self.namespace_filter = None;
            }
            None => {
                tracing::debug!(namespaces = ?unique, "filtering namespaces client-side");
                self.namespace_filter = Some(unique);
            }
        }
    }

    pub fn request(&self) -> &Request<'s> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<'s> {
        &mut self.request
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn limit_parameter(&self) -> Option<&str> {
        self.limit.as_ref().map(|target| target.parameter.as_str())
    }

    fn cap_reached(&self) -> bool {
        self.cap.is_some_and(|cap| self.emitted >= cap)
    }

    fn fetch_page(&mut self) -> Result<()> {
        self.apply_batch_size();
        let document = self.request.submit()?;
        let continuation = document.get("continue").and_then(Value::as_object).cloned();
        let items = result_items(&document, &self.result_key);
        let produced = items.as_ref().map_or(0, Vec::len);

        match items {
            Some(items) => {
                let extraction = if self.merge.is_some() {
                    self.merge_page(items)
                } else {
                    self.extract(items)
                };
                if extraction == Extraction::CapReached {
                    self.finished = true;
                    return Ok(());
                }
            }
            None if continuation.is_some() => {
                tracing::debug!(key = %self.result_key, "no result data in batch; continuing");
            }
            None => {}
        }

        let Some(continuation) = continuation else {
            self.finish();
            return Ok(());
        };
        if produced == 0 {
            self.grow_batch();
        }
        self.apply_continuation(&continuation);
        Ok(())
    }

    fn current_batch(&mut self) -> Option<u64> {
        let ceiling = self.limit.as_ref()?.ceiling;
        let increment = self.increment;
        Some(*self.batch.get_or_insert_with(|| {
            increment.unwrap_or(ceiling).min(ceiling).max(1)
        }))
    }

    fn apply_batch_size(&mut self) {
        let Some(batch) = self.current_batch() else {
            return;
        };
        let mut size = batch;
        if let Some(cap) = self.cap {
            let remaining = cap.saturating_sub(self.emitted + self.pending.len());
            size = size.min(u64::try_from(remaining).unwrap_or(u64::MAX).max(1));
        }
        if let Some(target) = &self.limit {
            tracing::debug!(parameter = %target.parameter, size, "setting batch size");
            self.request.params_mut().set(target.parameter.clone(), size);
        }
    }

    /// Sparse regions return continuation-only pages; ask for more next time.
    fn grow_batch(&mut self) {
        let Some(batch) = self.current_batch() else {
            return;
        };
        let ceiling = self.limit.as_ref().map_or(batch, |target| target.ceiling);
        let grown = batch.saturating_mul(2).min(ceiling);
        if grown != batch {
            tracing::debug!(from = batch, to = grown, "empty batch; growing batch size");
        }
        self.batch = Some(grown);
    }

    fn apply_continuation(&mut self, continuation: &Map<String, Value>) {
        let params = self.request.params_mut();
        for key in self.continue_keys.drain(..) {
            if !continuation.contains_key(&key) {
                params.remove(&key);
            }
        }
        for (key, value) in continuation {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            params.set(key.clone(), text.as_str());
            self.continue_keys.push(key.clone());
        }
    }

    fn extract(&mut self, items: Vec<Value>) -> Extraction {
        for item in items {
            if let Some(filter) = &self.namespace_filter
                && item
                    .get("ns")
                    .and_then(Value::as_i64)
                    .is_some_and(|ns| !filter.contains(&ns))
            {
                continue;
            }
            self.pending.push_back(item);
            if self
                .cap
                .is_some_and(|cap| self.emitted + self.pending.len() >= cap)
            {
                return Extraction::CapReached;
            }
        }
        Extraction::Continue
    }

    fn merge_page(&mut self, items: Vec<Value>) -> Extraction {
        let Some(mut merge) = self.merge.take() else {
            return self.extract(items);
        };
        let present = items
            .iter()
            .filter_map(|item| item.get(&merge.key).and_then(Value::as_str))
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>();
        let (complete, open): (Vec<_>, Vec<_>) = merge
            .entries
            .drain(..)
            .partition(|(id, _)| !present.contains(id));
        merge.entries = open;

        for item in items {
            let Some(id) = item.get(&merge.key).and_then(Value::as_str).map(ToString::to_string)
            else {
                tracing::warn!(key = %merge.key, "result item has no identifier; skipping");
                continue;
            };
            match merge.entries.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, entity)) => merge_fields(entity, item),
                None => merge.entries.push((id, item)),
            }
        }
        self.merge = Some(merge);
        self.extract(complete.into_iter().map(|(_, entity)| entity).collect())
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(merge) = self.merge.as_mut() {
            let remaining = merge
                .entries
                .drain(..)
                .map(|(_, entity)| entity)
                .collect::<Vec<_>>();
            self.extract(remaining);
        }
    }
}

impl Iterator for QueryCursor<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cap_reached() {
                self.finished = true;
                self.pending.clear();
                return None;
            }
            if let Some(item) = self.pending.pop_front() {
                self.emitted += 1;
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }
            if let Err(error) = self.fetch_page() {
                self.finished = true;
                return Some(Err(error));
            }
        }
    }
}

/// Items under `query.<key>` in server order.
fn result_items(document: &Value, key: &str) -> Option<Vec<Value>> {
    let query = document.get("query")?;
    match query.get(key)? {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => {
            if let Some(Value::Array(results)) = map.get("results") {
                return Some(results.clone());
            }
            if let Some(order) = query.get("pageids").and_then(Value::as_array) {
                return Some(
                    order
                        .iter()
                        .filter_map(|id| match id {
                            Value::String(id) => map.get(id),
                            other => map.get(&other.to_string()),
                        })
                        .cloned()
                        .collect(),
                );
            }
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(left, _), (right, _)| compare_keys(left, right));
            Some(entries.into_iter().map(|(_, value)| value.clone()).collect())
        }
        _ => None,
    }
}

fn compare_keys(left: &str, right: &str) -> Ordering {
    match (left.parse::<i64>(), right.parse::<i64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left.cmp(right),
    }
}

/// Lists concatenate; scalars keep the first value seen; new fields are added.
fn merge_fields(target: &mut Value, fragment: Value) {
    let (Some(target), Value::Object(fragment)) = (target.as_object_mut(), fragment) else {
        return;
    };
    for (field, value) in fragment {
        match target.get_mut(&field) {
            Some(Value::Array(existing)) => {
                if let Value::Array(more) = value {
                    existing.extend(more);
                }
            }
            Some(_) => {}
            None => {
                target.insert(field, value);
            }
        }
    }
}
