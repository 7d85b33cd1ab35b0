use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use std::collections::BTreeSet;
use std::fmt;

/// Label requirement operators, as they appear on node selector terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RequirementParseError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("operator {0:?} on key '{1}' requires exactly one integer value")]
    BadBound(Op, String),
}

/// A single-key label requirement in normal form: a value set with a
/// complement flag, plus optional integer bounds. Every operator maps onto
/// this form, which makes intersection closed:
///
///   In(S)          = { complement: false, values: S }
///   NotIn(S)       = { complement: true,  values: S }
///   Exists         = { complement: true,  values: {} }
///   DoesNotExist   = { complement: false, values: {} }
///   Gt(n) / Lt(n)  = Exists + bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
}

fn bounds_admit(greater_than: Option<i64>, less_than: Option<i64>, value: &str) -> bool {
    if greater_than.is_none() && less_than.is_none() {
        return true;
    }
    let Ok(n) = value.parse::<i64>() else {
        return false;
    };
    greater_than.is_none_or(|g| n > g) && less_than.is_none_or(|l| n < l)
}

impl Requirement {
    pub fn new_in<I, V>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Requirement {
            key: key.to_string(),
            complement: false,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
        }
    }

    pub fn new_not_in<I, V>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Requirement {
            key: key.to_string(),
            complement: true,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
        }
    }

    pub fn exists(key: &str) -> Self {
        Requirement::new_not_in(key, Vec::<String>::new())
    }

    pub fn does_not_exist(key: &str) -> Self {
        Requirement::new_in(key, Vec::<String>::new())
    }

    pub fn greater_than(key: &str, bound: i64) -> Self {
        Requirement {
            greater_than: Some(bound),
            ..Requirement::exists(key)
        }
    }

    pub fn less_than(key: &str, bound: i64) -> Self {
        Requirement {
            less_than: Some(bound),
            ..Requirement::exists(key)
        }
    }

    pub fn try_from_node_selector(
        selector: &NodeSelectorRequirement,
    ) -> Result<Self, RequirementParseError> {
        let values = selector.values.clone().unwrap_or_default();
        let bound = |op: Op| -> Result<i64, RequirementParseError> {
            if values.len() != 1 {
                return Err(RequirementParseError::BadBound(op, selector.key.clone()));
            }
            values[0]
                .parse()
                .map_err(|_| RequirementParseError::BadBound(op, selector.key.clone()))
        };
        Ok(match selector.operator.as_str() {
            "In" => Requirement::new_in(&selector.key, values),
            "NotIn" => Requirement::new_not_in(&selector.key, values),
            "Exists" => Requirement::exists(&selector.key),
            "DoesNotExist" => Requirement::does_not_exist(&selector.key),
            "Gt" => Requirement::greater_than(&selector.key, bound(Op::Gt)?),
            "Lt" => Requirement::less_than(&selector.key, bound(Op::Lt)?),
            other => return Err(RequirementParseError::UnknownOperator(other.to_string())),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn greater_than_bound(&self) -> Option<i64> {
        self.greater_than
    }

    pub fn less_than_bound(&self) -> Option<i64> {
        self.less_than
    }

    /// The operator this normal form corresponds to.
    pub fn operator(&self) -> Op {
        if self.complement {
            match (self.greater_than, self.less_than, self.values.is_empty()) {
                (Some(_), None, true) => Op::Gt,
                (None, Some(_), true) => Op::Lt,
                (None, None, true) => Op::Exists,
                _ => Op::NotIn,
            }
        } else if self.values.is_empty() {
            Op::DoesNotExist
        } else {
            Op::In
        }
    }

    /// Membership test for a concrete label value.
    pub fn has(&self, value: &str) -> bool {
        let in_set = self.values.contains(value) != self.complement;
        in_set && bounds_admit(self.greater_than, self.less_than, value)
    }

    /// Number of satisfying values; `None` means unbounded.
    pub fn len(&self) -> Option<usize> {
        if !self.complement {
            return Some(
                self.values
                    .iter()
                    .filter(|v| bounds_admit(self.greater_than, self.less_than, v))
                    .count(),
            );
        }
        match (self.greater_than, self.less_than) {
            (Some(g), Some(l)) => {
                let span = (l - g - 1).max(0) as usize;
                let excluded = self
                    .values
                    .iter()
                    .filter(|v| v.parse::<i64>().is_ok_and(|n| n > g && n < l))
                    .count();
                Some(span.saturating_sub(excluded))
            }
            _ => None,
        }
    }

    /// True iff no value can satisfy this requirement. Note that
    /// `DoesNotExist` is also empty in this sense; it is satisfied by the
    /// absence of the key, never by a value.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn is_does_not_exist(&self) -> bool {
        self.operator() == Op::DoesNotExist
    }

    /// Satisfied by the absence of the key. NotIn and DoesNotExist both
    /// match a node that simply lacks the label.
    pub fn matches_absent_key(&self) -> bool {
        matches!(self.operator(), Op::NotIn | Op::DoesNotExist)
    }

    /// Iterates the concrete values of an `In`-form requirement.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .filter(|v| self.complement || bounds_admit(self.greater_than, self.less_than, v))
            .map(String::as_str)
    }

    /// The deterministic choice when one value must be picked: the
    /// lexicographically smallest satisfying value. `None` for complement
    /// forms, which have no enumerable values.
    pub fn any(&self) -> Option<&str> {
        if self.complement {
            return None;
        }
        self.values
            .iter()
            .find(|v| bounds_admit(self.greater_than, self.less_than, v))
            .map(String::as_str)
    }

    /// Intersection: a label set satisfies the result iff it satisfies both
    /// inputs. Closed over the normal form.
    pub fn intersect(&self, other: &Requirement) -> Requirement {
        debug_assert_eq!(self.key, other.key);
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let (complement, values): (bool, BTreeSet<String>) =
            match (self.complement, other.complement) {
                (false, false) => (
                    false,
                    self.values.intersection(&other.values).cloned().collect(),
                ),
                (false, true) => (
                    false,
                    self.values.difference(&other.values).cloned().collect(),
                ),
                (true, false) => (
                    false,
                    other.values.difference(&self.values).cloned().collect(),
                ),
                (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            };
        if complement {
            return Requirement {
                key: self.key.clone(),
                complement,
                values,
                greater_than,
                less_than,
            };
        }
        // Concrete sets fold the bounds in and drop them.
        Requirement {
            key: self.key.clone(),
            complement,
            values: values
                .into_iter()
                .filter(|v| bounds_admit(greater_than, less_than, v))
                .collect(),
            greater_than: None,
            less_than: None,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator() {
            Op::In => write!(
                f,
                "{} In [{}]",
                self.key,
                self.values.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            Op::NotIn => write!(
                f,
                "{} NotIn [{}]",
                self.key,
                self.values.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            Op::Exists => write!(f, "{} Exists", self.key),
            Op::DoesNotExist => write!(f, "{} DoesNotExist", self.key),
            Op::Gt => write!(f, "{} Gt {}", self.key, self.greater_than.unwrap_or(0)),
            Op::Lt => write!(f, "{} Lt {}", self.key, self.less_than.unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r_in(values: &[&str]) -> Requirement {
        Requirement::new_in("k", values.iter().map(|s| s.to_string()))
    }

    fn r_not_in(values: &[&str]) -> Requirement {
        Requirement::new_not_in("k", values.iter().map(|s| s.to_string()))
    }

    #[test]
    fn in_intersection_is_set_intersection() {
        let out = r_in(&["a", "b", "c"]).intersect(&r_in(&["b", "c", "d"]));
        assert_eq!(out.values().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(!out.is_empty());
        assert!(r_in(&["a"]).intersect(&r_in(&["b"])).is_empty());
    }

    #[test]
    fn in_and_not_in_is_difference() {
        let out = r_in(&["a", "b"]).intersect(&r_not_in(&["b"]));
        assert_eq!(out.values().collect::<Vec<_>>(), vec!["a"]);
        // symmetric
        let out = r_not_in(&["b"]).intersect(&r_in(&["a", "b"]));
        assert_eq!(out.values().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn not_in_pair_unions_the_excluded_set() {
        let out = r_not_in(&["a"]).intersect(&r_not_in(&["b"]));
        assert_eq!(out.operator(), Op::NotIn);
        assert!(!out.has("a"));
        assert!(!out.has("b"));
        assert!(out.has("c"));
        assert_eq!(out.len(), None);
    }

    #[test]
    fn exists_is_the_identity() {
        let exists = Requirement::exists("k");
        let concrete = r_in(&["a", "b"]);
        assert_eq!(exists.intersect(&concrete), concrete);
        assert_eq!(concrete.intersect(&exists), concrete);
    }

    #[test]
    fn does_not_exist_annihilates_nonempty_sets() {
        let dne = Requirement::does_not_exist("k");
        assert!(dne.intersect(&r_in(&["a"])).is_empty());
        assert!(dne.intersect(&Requirement::exists("k")).is_empty());
        // DoesNotExist folded with itself stays DoesNotExist.
        assert!(dne.intersect(&dne).is_does_not_exist());
    }

    #[test]
    fn numeric_bounds_filter_concrete_sets() {
        let out = Requirement::greater_than("k", 3).intersect(&r_in(&["2", "4", "10", "x"]));
        assert_eq!(out.values().collect::<Vec<_>>(), vec!["10", "4"]);
        let out = Requirement::less_than("k", 5).intersect(&r_in(&["2", "4", "10"]));
        assert_eq!(out.values().collect::<Vec<_>>(), vec!["2", "4"]);
    }

    #[test]
    fn bounds_merge_toward_the_tighter_side() {
        let out = Requirement::greater_than("k", 3).intersect(&Requirement::greater_than("k", 7));
        assert!(!out.has("5"));
        assert!(out.has("8"));
        let out = Requirement::less_than("k", 9).intersect(&Requirement::less_than("k", 4));
        assert!(out.has("3"));
        assert!(!out.has("5"));
    }

    #[test]
    fn disjoint_bounds_are_incompatible() {
        // Gt(n) with Lt(m) is empty iff n >= m-1: no integer strictly between.
        let out = Requirement::greater_than("k", 4).intersect(&Requirement::less_than("k", 5));
        assert!(out.is_empty());
        let out = Requirement::greater_than("k", 4).intersect(&Requirement::less_than("k", 6));
        assert!(!out.is_empty());
        assert!(out.has("5"));
    }

    #[test]
    fn any_picks_the_lexicographically_smallest_value() {
        assert_eq!(r_in(&["c", "a", "b"]).any(), Some("a"));
        assert_eq!(r_not_in(&["a"]).any(), None);
    }

    #[test]
    fn membership_respects_complement_and_bounds() {
        assert!(r_in(&["a"]).has("a"));
        assert!(!r_in(&["a"]).has("b"));
        assert!(r_not_in(&["a"]).has("b"));
        assert!(Requirement::greater_than("k", 3).has("4"));
        assert!(!Requirement::greater_than("k", 3).has("3"));
        assert!(!Requirement::greater_than("k", 3).has("not-a-number"));
    }

    #[test]
    fn parses_node_selector_operators() {
        let parsed = Requirement::try_from_node_selector(&NodeSelectorRequirement {
            key: "zone".into(),
            operator: "In".into(),
            values: Some(vec!["z1".into(), "z2".into()]),
        })
        .unwrap();
        assert_eq!(parsed, Requirement::new_in("zone", ["z1", "z2"]));

        let parsed = Requirement::try_from_node_selector(&NodeSelectorRequirement {
            key: "size".into(),
            operator: "Gt".into(),
            values: Some(vec!["5".into()]),
        })
        .unwrap();
        assert_eq!(parsed, Requirement::greater_than("size", 5));

        assert!(
            Requirement::try_from_node_selector(&NodeSelectorRequirement {
                key: "size".into(),
                operator: "Gt".into(),
                values: Some(vec!["5".into(), "6".into()]),
            })
            .is_err()
        );
        assert!(
            Requirement::try_from_node_selector(&NodeSelectorRequirement {
                key: "k".into(),
                operator: "Near".into(),
                values: None,
            })
            .is_err()
        );
    }

    #[test]
    fn constraint_soundness_samples() {
        // If a value satisfies the intersection it satisfies both sides.
        let cases = vec![
            (r_in(&["a", "b"]), r_not_in(&["a"])),
            (r_in(&["1", "2", "3"]), Requirement::greater_than("k", 1)),
            (r_not_in(&["x"]), r_not_in(&["y"])),
            (Requirement::exists("k"), r_in(&["q"])),
        ];
        for (left, right) in cases {
            let out = left.intersect(&right);
            for v in ["a", "b", "q", "x", "y", "1", "2", "3"] {
                if out.has(v) {
                    assert!(left.has(v), "{} admitted by {} but not {}", v, out, left);
                    assert!(right.has(v), "{} admitted by {} but not {}", v, out, right);
                }
            }
        }
    }
}
