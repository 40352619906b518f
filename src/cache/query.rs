//! Composable query plans (filter + sort + limit) and named presets

use crate::cache::document::Document;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

type Filter<T> = Arc<dyn Fn(&Document<T>) -> bool + Send + Sync>;
type Comparator<T> = Arc<dyn Fn(&Document<T>, &Document<T>) -> Ordering + Send + Sync>;

/// A filter + sort + limit pipeline over documents
pub struct QueryPlan<T> {
    filters: Vec<Filter<T>>,
    order: Option<Comparator<T>>,
    limit: Option<usize>,
}

impl<T> Clone for QueryPlan<T> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            order: self.order.clone(),
            limit: self.limit,
        }
    }
}

impl<T> Default for QueryPlan<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueryPlan<T> {
    /// A plan that returns everything in input order
    pub fn new() -> Self {
        Self { filters: Vec::new(), order: None, limit: None }
    }

    /// Keep documents matching `predicate`; filters compose with AND
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Document<T>) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(predicate));
        self
    }

    /// Sort with a comparator; later calls replace earlier ones
    pub fn sort_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&Document<T>, &Document<T>) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(compare));
        self
    }

    /// Newest `created_at` first
    pub fn newest_first(self) -> Self {
        self.sort_by(|a, b| b.created_at.cmp(&a.created_at))
    }

    /// Most recently accessed first
    pub fn recently_accessed(self) -> Self {
        self.sort_by(|a, b| b.last_access.cmp(&a.last_access))
    }

    /// Highest `access_count` first
    pub fn most_accessed(self) -> Self {
        self.sort_by(|a, b| b.access_count.cmp(&a.access_count))
    }

    /// Cap the number of results
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Apply the plan; sorting is stable so ties keep input order
    pub fn execute<'a, I>(&self, docs: I) -> Vec<&'a Document<T>>
    where
        I: IntoIterator<Item = &'a Document<T>>,
        T: 'a,
    {
        let mut out: Vec<&Document<T>> = docs
            .into_iter()
            .filter(|doc| self.filters.iter().all(|f| f(doc)))
            .collect();

        if let Some(order) = &self.order {
            out.sort_by(|a, b| order(a, b));
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Named query plans, invoked explicitly by name
pub struct QueryPresets<T> {
    plans: BTreeMap<String, QueryPlan<T>>,
}

impl<T> Default for QueryPresets<T> {
    fn default() -> Self {
        Self { plans: BTreeMap::new() }
    }
}

impl<T> QueryPresets<T> {
    /// Presets every collection understands: `recent`, `most_accessed`, `recently_used`
    pub fn with_defaults() -> Self {
        let mut presets = Self::default();
        presets.register("recent", QueryPlan::new().newest_first().limit(50));
        presets.register("most_accessed", QueryPlan::new().most_accessed().limit(20));
        presets.register("recently_used", QueryPlan::new().recently_accessed().limit(20));
        presets
    }

    /// Add or replace a preset
    pub fn register(&mut self, name: impl Into<String>, plan: QueryPlan<T>) {
        self.plans.insert(name.into(), plan);
    }

    /// Look up a preset
    pub fn get(&self, name: &str) -> Option<&QueryPlan<T>> {
        self.plans.get(name)
    }

    /// Registered preset names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.plans.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<Document<u32>> {
        (0..10u32)
            .map(|i| {
                let mut doc = Document::new(format!("d{}", i), i, 1_000 + u64::from(i));
                doc.access_count = u64::from(i % 3);
                doc
            })
            .collect()
    }

    #[test]
    fn test_filter_sort_limit() {
        let docs = docs();
        let plan = QueryPlan::new()
            .filter(|d: &Document<u32>| d.payload % 2 == 0)
            .newest_first()
            .limit(3);
        let ids: Vec<&str> = plan.execute(&docs).iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d8", "d6", "d4"]);
    }

    #[test]
    fn test_filters_compose() {
        let docs = docs();
        let plan = QueryPlan::new()
            .filter(|d: &Document<u32>| d.payload > 2)
            .filter(|d: &Document<u32>| d.payload < 6);
        assert_eq!(plan.execute(&docs).len(), 3);
    }

    #[test]
    fn test_stable_sort_keeps_input_order() {
        let docs = docs();
        let plan = QueryPlan::new().most_accessed().limit(4);
        let ids: Vec<&str> = plan.execute(&docs).iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d5", "d8", "d1"]);
    }

    #[test]
    fn test_presets() {
        let mut presets: QueryPresets<u32> = QueryPresets::with_defaults();
        presets.register("small", QueryPlan::new().filter(|d: &Document<u32>| d.payload < 2));
        assert_eq!(presets.names(), vec!["most_accessed", "recent", "recently_used", "small"]);

        let docs = docs();
        assert_eq!(presets.get("small").unwrap().execute(&docs).len(), 2);
        assert_eq!(presets.get("recent").unwrap().execute(&docs)[0].id, "d9");
        assert!(presets.get("missing").is_none());
    }
}
