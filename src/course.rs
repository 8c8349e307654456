//! Course identity, availability and election rules
//!
//! A course's identity is the triple `(name, class_no, school)`. Quota and
//! the action href are transient attributes attached by the listing parser;
//! two courses with the same identity compare equal regardless of them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Delay rule sentinel: no threshold configured.
pub const NO_DELAY: i32 = -1;

/// Simplified course identity, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CourseId {
    pub name: String,
    pub class_no: String,
    pub school: String,
}

impl std::fmt::Display for CourseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}] ({})", self.name, self.class_no, self.school)
    }
}

/// A course as configured or as parsed from the listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub name: String,
    pub class_no: String,
    pub school: String,
    /// `(max_quota, used_quota)` when parsed from the plan table.
    pub quota: Option<(u32, u32)>,
    /// Opaque action link from the 补选 column.
    pub href: Option<String>,
}

impl PartialEq for Course {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.class_no == other.class_no && self.school == other.school
    }
}

impl Eq for Course {}

impl std::hash::Hash for Course {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.class_no.hash(state);
        self.school.hash(state);
    }
}

impl std::fmt::Display for Course {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.quota {
            Some((max, used)) => write!(
                f,
                "{}[{}] ({}) {}/{}",
                self.name, self.class_no, self.school, used, max
            ),
            None => write!(f, "{}[{}] ({})", self.name, self.class_no, self.school),
        }
    }
}

impl Course {
    /// A bare identity course (as declared in configuration).
    #[must_use]
    pub fn new(name: impl Into<String>, class_no: impl Into<String>, school: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_no: class_no.into(),
            school: school.into(),
            quota: None,
            href: None,
        }
    }

    /// A fully attributed course (as parsed from the plan table).
    #[must_use]
    pub fn with_detail(
        name: impl Into<String>,
        class_no: impl Into<String>,
        school: impl Into<String>,
        quota: (u32, u32),
        href: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            class_no: class_no.into(),
            school: school.into(),
            quota: Some(quota),
            href: Some(href.into()),
        }
    }

    #[must_use]
    pub fn id(&self) -> CourseId {
        CourseId {
            name: self.name.clone(),
            class_no: self.class_no.clone(),
            school: self.school.clone(),
        }
    }

    /// `max_quota − used_quota`, saturating.
    #[must_use]
    pub fn remaining_quota(&self) -> u32 {
        match self.quota {
            Some((max, used)) => max.saturating_sub(used),
            None => 0,
        }
    }

    #[must_use]
    pub fn used_quota(&self) -> u32 {
        self.quota.map_or(0, |(_, used)| used)
    }

    /// Available means at least one seat left and an action link present.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.remaining_quota() > 0 && self.href.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// The ordered goal set plus the rules attached to it. Indices into `goals`
/// are the stable handle used by mutex/delay lookups.
#[derive(Debug, Default)]
pub struct GoalSet {
    pub goals: Vec<Course>,
    /// Symmetric adjacency: `mutex[i]` holds the goal indices that conflict
    /// with goal `i`.
    pub mutex: Vec<HashSet<usize>>,
    /// Delay threshold per goal (`NO_DELAY` when unconfigured).
    pub delays: Vec<i32>,
}

impl GoalSet {
    /// Build from configured courses, mutex groups (lists of indices into
    /// `courses`) and delay rules `(index, threshold)`.
    pub fn build(
        courses: Vec<Course>,
        mutex_groups: &[Vec<usize>],
        delay_rules: &[(usize, i32)],
    ) -> Result<Self, String> {
        let n = courses.len();
        let mut mutex = vec![HashSet::new(); n];
        for group in mutex_groups {
            for &ix in group {
                if ix >= n {
                    return Err(format!("mutex rule references undefined course index {ix}"));
                }
            }
            for (a, &ix1) in group.iter().enumerate() {
                for &ix2 in group.iter().skip(a + 1) {
                    mutex[ix1].insert(ix2);
                    mutex[ix2].insert(ix1);
                }
            }
        }
        let mut delays = vec![NO_DELAY; n];
        for &(ix, threshold) in delay_rules {
            if ix >= n {
                return Err(format!("delay rule references undefined course index {ix}"));
            }
            delays[ix] = threshold;
        }
        Ok(Self {
            goals: courses,
            mutex,
            delays,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.goals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    /// Goal indices not yet ignored, in priority order.
    #[must_use]
    pub fn pending<'a>(
        &'a self,
        ignored: &'a HashMap<CourseId, crate::error::IgnoreReason>,
    ) -> Vec<usize> {
        self.goals
            .iter()
            .enumerate()
            .filter(|(_, c)| !ignored.contains_key(&c.id()))
            .map(|(ix, _)| ix)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IgnoreReason;

    #[test]
    fn test_identity_equality_ignores_quota() {
        let a = Course::new("代数", "1", "数学学院");
        let b = Course::with_detail("代数", "1", "数学学院", (10, 9), "/elect?x=1");
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_availability_requires_seat_and_href() {
        let full = Course::with_detail("A", "1", "S", (10, 10), "/x");
        assert!(!full.is_available());
        let open = Course::with_detail("A", "1", "S", (10, 9), "/x");
        assert!(open.is_available());
        let no_href = Course {
            href: None,
            ..open.clone()
        };
        assert!(!no_href.is_available());
        assert_eq!(open.remaining_quota(), 1);
    }

    #[test]
    fn test_goalset_mutex_symmetry() {
        let courses = vec![
            Course::new("A", "1", "S"),
            Course::new("B", "1", "S"),
            Course::new("C", "1", "S"),
        ];
        let gs = GoalSet::build(courses, &[vec![0, 1]], &[(2, 3)]).unwrap();
        assert!(gs.mutex[0].contains(&1));
        assert!(gs.mutex[1].contains(&0));
        assert!(gs.mutex[2].is_empty());
        assert_eq!(gs.delays, vec![NO_DELAY, NO_DELAY, 3]);
    }

    #[test]
    fn test_goalset_rejects_bad_index() {
        let courses = vec![Course::new("A", "1", "S")];
        assert!(GoalSet::build(courses.clone(), &[vec![0, 5]], &[]).is_err());
        assert!(GoalSet::build(courses, &[], &[(9, 1)]).is_err());
    }

    #[test]
    fn test_pending_skips_ignored() {
        let courses = vec![Course::new("A", "1", "S"), Course::new("B", "2", "S")];
        let gs = GoalSet::build(courses, &[], &[]).unwrap();
        let mut ignored = HashMap::new();
        ignored.insert(gs.goals[0].id(), IgnoreReason::Elected);
        assert_eq!(gs.pending(&ignored), vec![1]);
    }
}
