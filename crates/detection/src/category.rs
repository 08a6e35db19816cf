//! Category allow-list filters for build-time checks.

use std::collections::BTreeSet;
use std::sync::Mutex;

use stackwatch_core::Policy;

/// Decides whether a policy takes part in a detection call.
pub trait PolicyFilter: Send + Sync {
    fn allows(&self, policy: &Policy) -> bool;
}

/// Case-insensitive category allow-list. An empty list allows every policy.
///
/// Remembers which allow-listed categories matched at least one policy so
/// callers can report the ones that matched nothing.
#[derive(Debug, Default)]
pub struct CategoryFilter {
    categories: Vec<String>,
    matched: Mutex<BTreeSet<usize>>,
}

impl CategoryFilter {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            matched: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Allow-listed categories that have not matched any evaluated policy.
    pub fn unused_categories(&self) -> Vec<String> {
        let matched = self.matched.lock().expect("category filter lock poisoned");
        self.categories
            .iter()
            .enumerate()
            .filter(|(i, _)| !matched.contains(i))
            .map(|(_, c)| c.clone())
            .collect()
    }
}

impl PolicyFilter for CategoryFilter {
    fn allows(&self, policy: &Policy) -> bool {
        if self.categories.is_empty() {
            return true;
        }
        let hits: Vec<usize> = self
            .categories
            .iter()
            .enumerate()
            .filter(|(_, c)| policy.has_category(c))
            .map(|(i, _)| i)
            .collect();
        if hits.is_empty() {
            return false;
        }
        self.matched
            .lock()
            .expect("category filter lock poisoned")
            .extend(hits);
        true
    }
}

/// Filter over `categories`, paired with the accessor for unmatched ones.
pub fn make_category_filter<I, S>(categories: I) -> CategoryFilter
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CategoryFilter::new(categories)
}
