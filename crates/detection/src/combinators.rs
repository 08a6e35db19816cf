//! Predicate and matcher combinators.
//!
//! A [`Predicate`] decides whether a policy is a candidate for an entity at
//! all (scope, whitelists). A [`Matcher`] produces the violations the entity
//! commits. Both are cheap to clone and shared across threads once a policy
//! has been compiled.
//!
//! `Option<Predicate>` and `Option<Matcher>` carry the "absent" case: an
//! absent operand is the identity of every combinator, and combining two
//! absent operands yields an absent result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use stackwatch_core::{Image, Violation};

use crate::entity::EntityRef;
use crate::error::Result;

type PredicateFn = dyn Fn(&EntityRef<'_>) -> bool + Send + Sync;
type MatcherFn = dyn Fn(&EntityRef<'_>, &mut MatchCache) -> Result<Vec<Violation>> + Send + Sync;

// ── Predicate ───────────────────────────────────────────────────────

/// Pure function of an entity deciding candidacy.
#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&EntityRef<'_>) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn test(&self, entity: &EntityRef<'_>) -> bool {
        (self.0)(entity)
    }

    /// Both operands are evaluated; the result is their conjunction.
    pub fn and(self, other: Option<Predicate>) -> Predicate {
        match other {
            None => self,
            Some(other) => Predicate::new(move |e| {
                let left = self.test(e);
                let right = other.test(e);
                left && right
            }),
        }
    }

    /// Both operands are evaluated; the result is their disjunction.
    pub fn or(self, other: Option<Predicate>) -> Predicate {
        match other {
            None => self,
            Some(other) => Predicate::new(move |e| {
                let left = self.test(e);
                let right = other.test(e);
                left || right
            }),
        }
    }

    pub fn negate(self) -> Predicate {
        Predicate::new(move |e| !self.test(e))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// AND over optional predicates.
pub fn and_predicates(a: Option<Predicate>, b: Option<Predicate>) -> Option<Predicate> {
    match (a, b) {
        (Some(a), b) => Some(a.and(b)),
        (None, b) => b,
    }
}

/// OR over optional predicates.
pub fn or_predicates(a: Option<Predicate>, b: Option<Predicate>) -> Option<Predicate> {
    match (a, b) {
        (Some(a), b) => Some(a.or(b)),
        (None, b) => b,
    }
}

// ── Matcher ─────────────────────────────────────────────────────────

/// Function of an entity producing the violations it commits.
#[derive(Clone)]
pub struct Matcher(Arc<MatcherFn>);

impl Matcher {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&EntityRef<'_>, &mut MatchCache) -> Result<Vec<Violation>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A matcher that never reports anything.
    pub fn none() -> Self {
        Matcher::new(|_, _| Ok(Vec::new()))
    }

    pub fn run(&self, entity: &EntityRef<'_>, cache: &mut MatchCache) -> Result<Vec<Violation>> {
        (self.0)(entity, cache)
    }

    /// AND: violations are reported only when both sides report some, and
    /// then the concatenation is returned. Absent `other` leaves `self` as is.
    pub fn must_also_violate(self, other: Option<Matcher>) -> Matcher {
        let Some(other) = other else {
            return self;
        };
        Matcher::new(move |e, cache| {
            let mut left = self.run(e, cache)?;
            if left.is_empty() {
                return Ok(Vec::new());
            }
            let right = other.run(e, cache)?;
            if right.is_empty() {
                return Ok(Vec::new());
            }
            left.extend(right);
            Ok(left)
        })
    }

    /// OR: the union of both sides' violations. Absent `other` leaves `self`
    /// as is.
    pub fn can_also_violate(self, other: Option<Matcher>) -> Matcher {
        let Some(other) = other else {
            return self;
        };
        Matcher::new(move |e, cache| {
            let mut left = self.run(e, cache)?;
            left.extend(other.run(e, cache)?);
            Ok(left)
        })
    }

    /// Gate: runs `self` only for entities the predicate accepts, otherwise
    /// reports nothing. An absent predicate always runs.
    pub fn process_if(self, predicate: Option<Predicate>) -> Matcher {
        let Some(predicate) = predicate else {
            return self;
        };
        Matcher::new(move |e, cache| {
            if predicate.test(e) {
                self.run(e, cache)
            } else {
                Ok(Vec::new())
            }
        })
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Matcher(..)")
    }
}

/// AND-reduction over optional matchers.
pub fn must_violate_all(a: Option<Matcher>, b: Option<Matcher>) -> Option<Matcher> {
    match (a, b) {
        (Some(a), b) => Some(a.must_also_violate(b)),
        (None, b) => b,
    }
}

// ── Per-evaluation cache ────────────────────────────────────────────

/// Memoizes per-image derived values while one entity is evaluated against
/// many policies. Owned by a single detection call, never shared.
#[derive(Debug, Default)]
pub struct MatchCache {
    max_cvss: HashMap<String, Option<f32>>,
    computed: usize,
}

impl MatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest CVSS score of `image`, computed once per image name.
    pub fn max_cvss(&mut self, image: &Image) -> Option<f32> {
        let key = cache_key(image);
        if let Some(score) = self.max_cvss.get(&key) {
            return *score;
        }
        self.computed += 1;
        let score = image.max_cvss();
        self.max_cvss.insert(key, score);
        score
    }

    /// Number of values computed rather than served from the cache.
    pub fn computed(&self) -> usize {
        self.computed
    }
}

fn cache_key(image: &Image) -> String {
    if image.id.is_empty() {
        image.name.full_name.clone()
    } else {
        image.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stackwatch_core::{Image, ImageComponent, ImageName, ImageScan, Vulnerability};

    use super::*;

    fn image() -> Image {
        Image::from_name("sha256:1", ImageName::parse("nginx"))
    }

    fn always(result: bool) -> Predicate {
        Predicate::new(move |_| result)
    }

    fn violating(field: &'static str) -> Matcher {
        Matcher::new(move |_, _| Ok(vec![Violation::new(field, format!("{field} violated"))]))
    }

    fn run(matcher: &Matcher) -> Vec<String> {
        let img = image();
        let mut cache = MatchCache::new();
        matcher
            .run(&EntityRef::Image(&img), &mut cache)
            .unwrap()
            .into_iter()
            .map(|v| v.field)
            .collect()
    }

    #[test]
    fn absent_predicates_are_identity() {
        let img = image();
        let e = EntityRef::Image(&img);
        assert!(and_predicates(None, None).is_none());
        assert!(or_predicates(None, None).is_none());
        assert!(!and_predicates(None, Some(always(false))).unwrap().test(&e));
        assert!(or_predicates(Some(always(true)), None).unwrap().test(&e));
    }

    #[test]
    fn predicate_evaluates_both_sides() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = {
            let calls = calls.clone();
            Predicate::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
        };
        let img = image();
        let e = EntityRef::Image(&img);

        assert!(!always(false).and(Some(counting.clone())).test(&e));
        assert!(always(true).or(Some(counting)).test(&e));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(always(false).negate().test(&e));
    }

    #[test]
    fn must_also_violate_requires_both() {
        let both = violating("a").must_also_violate(Some(violating("b")));
        assert_eq!(run(&both), vec!["a", "b"]);

        let one_sided = violating("a").must_also_violate(Some(Matcher::none()));
        assert!(run(&one_sided).is_empty());

        let other_sided = Matcher::none().must_also_violate(Some(violating("b")));
        assert!(run(&other_sided).is_empty());

        assert_eq!(run(&violating("a").must_also_violate(None)), vec!["a"]);
    }

    #[test]
    fn can_also_violate_unions() {
        let either = Matcher::none().can_also_violate(Some(violating("b")));
        assert_eq!(run(&either), vec!["b"]);

        let both = violating("a").can_also_violate(Some(violating("b")));
        assert_eq!(run(&both), vec!["a", "b"]);
    }

    #[test]
    fn process_if_gates_the_matcher() {
        assert!(run(&violating("a").process_if(Some(always(false)))).is_empty());
        assert_eq!(run(&violating("a").process_if(Some(always(true)))), vec!["a"]);
        assert_eq!(run(&violating("a").process_if(None)), vec!["a"]);
    }

    #[test]
    fn cache_computes_once_per_image() {
        let mut img = image();
        img.scan = Some(ImageScan {
            scan_time: chrono::Utc::now(),
            components: vec![ImageComponent {
                name: "openssl".into(),
                version: "1.1.1".into(),
                vulns: vec![Vulnerability {
                    cve: "CVE-2022-0778".into(),
                    cvss: 7.5,
                }],
            }],
        });

        let mut cache = MatchCache::new();
        assert_eq!(cache.max_cvss(&img), Some(7.5));
        assert_eq!(cache.max_cvss(&img), Some(7.5));
        assert_eq!(cache.computed(), 1);
    }
}
