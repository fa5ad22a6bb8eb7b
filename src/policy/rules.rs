//! Ordered rule lists and the reject-then-accept matcher.
//!
//! # Evaluation Order
//!
//! 1. Reject list, in list order: the first matching rule wins
//! 2. Accept list, in list order: the first matching rule wins
//! 3. No match
//!
//! A tag set matching both a reject rule and an accept rule is always
//! reported as the reject outcome. There is no wildcard precedence beyond
//! list order, so rules must be ordered most specific first.

use super::selector::TagSelector;
use crate::tags::TagSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict attached to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Admit the connection.
    Accept,
    /// Refuse the connection.
    Reject,
}

impl fmt::Display for RuleList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleList::Reject => write!(f, "reject"),
            RuleList::Accept => write!(f, "accept"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "accept"),
            Action::Reject => write!(f, "reject"),
        }
    }
}

/// Action plus the identifier of the policy that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPolicy {
    /// Verdict.
    pub action: Action,
    /// Identifier reported in flow records.
    pub policy_id: String,
}

impl FlowPolicy {
    /// Accepting policy.
    pub fn accept(policy_id: impl Into<String>) -> Self {
        Self {
            action: Action::Accept,
            policy_id: policy_id.into(),
        }
    }

    /// Rejecting policy.
    pub fn reject(policy_id: impl Into<String>) -> Self {
        Self {
            action: Action::Reject,
            policy_id: policy_id.into(),
        }
    }
}

/// A tag predicate paired with a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Predicate over the presented tags.
    pub selector: TagSelector,
    /// Verdict and policy identifier.
    #[serde(flatten)]
    pub policy: FlowPolicy,
}

impl Rule {
    /// Build a rule.
    pub fn new(selector: TagSelector, policy: FlowPolicy) -> Self {
        Self { selector, policy }
    }
}

/// Which list a rule was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleList {
    /// The reject list.
    Reject,
    /// The accept list.
    Accept,
}

/// A matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    /// List the rule came from.
    pub list: RuleList,
    /// Position of the rule in its list.
    pub index: usize,
    /// The rule's verdict.
    pub policy: &'a FlowPolicy,
}

/// Outcome of evaluating a rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Admit; `None` when admitted without a matching rule.
    Accepted(Option<FlowPolicy>),
    /// Refuse; `None` when refused because nothing matched.
    Rejected(Option<FlowPolicy>),
}

impl Verdict {
    /// Whether this verdict admits the connection.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    /// The policy behind the verdict, if a rule matched.
    pub fn policy(&self) -> Option<&FlowPolicy> {
        match self {
            Verdict::Accepted(p) | Verdict::Rejected(p) => p.as_ref(),
        }
    }
}

/// Reject and accept lists evaluated together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Evaluated first.
    #[serde(default)]
    pub reject: Vec<Rule>,
    /// Evaluated when no reject rule matched.
    #[serde(default)]
    pub accept: Vec<Rule>,
}

impl RuleSet {
    /// Build a rule set from its two lists.
    pub fn new(reject: Vec<Rule>, accept: Vec<Rule>) -> Self {
        Self { reject, accept }
    }

    /// Find the first matching rule, reject list first.
    pub fn search(&self, tags: &TagSet) -> Option<RuleMatch<'_>> {
        first_match(&self.reject, tags, RuleList::Reject)
            .or_else(|| first_match(&self.accept, tags, RuleList::Accept))
    }

    /// Evaluate `tags` into a verdict.
    ///
    /// A reject-list match always refuses, whatever action the rule
    /// carries. An accept-list match admits only if its action is accept.
    /// With `require_accept`, a tag set matching no rule is refused
    /// (deny by default). Without it, only a matching rule can refuse.
    pub fn evaluate(&self, tags: &TagSet, require_accept: bool) -> Verdict {
        match self.search(tags) {
            Some(RuleMatch {
                list: RuleList::Accept,
                policy,
                ..
            }) if policy.action == Action::Accept => Verdict::Accepted(Some(policy.clone())),
            Some(m) => Verdict::Rejected(Some(m.policy.clone())),
            None if require_accept => Verdict::Rejected(None),
            None => Verdict::Accepted(None),
        }
    }

    /// Rules whose action disagrees with the list holding them, as
    /// `(list, index)`.
    pub fn mislisted(&self) -> Vec<(RuleList, usize)> {
        let reject = self
            .reject
            .iter()
            .enumerate()
            .filter(|(_, r)| r.policy.action != Action::Reject)
            .map(|(i, _)| (RuleList::Reject, i));
        let accept = self
            .accept
            .iter()
            .enumerate()
            .filter(|(_, r)| r.policy.action != Action::Accept)
            .map(|(i, _)| (RuleList::Accept, i));
        reject.chain(accept).collect()
    }

    /// Whether both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.reject.is_empty() && self.accept.is_empty()
    }
}

fn first_match<'a>(rules: &'a [Rule], tags: &TagSet, list: RuleList) -> Option<RuleMatch<'a>> {
    rules
        .iter()
        .position(|r| r.selector.matches(tags))
        .map(|index| RuleMatch {
            list,
            index,
            policy: &rules[index].policy,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::selector::Clause;

    fn rule(key: &str, value: &str, policy: FlowPolicy) -> Rule {
        Rule::new(TagSelector::new(vec![Clause::equal(key, value)]), policy)
    }

    fn web() -> TagSet {
        [("app", "web")].into_iter().collect()
    }

    #[test]
    fn test_reject_precedes_accept() {
        let rules = RuleSet::new(
            vec![rule("app", "web", FlowPolicy::reject("P2"))],
            vec![rule("app", "web", FlowPolicy::accept("P1"))],
        );

        let m = rules.search(&web()).unwrap();
        assert_eq!(m.list, RuleList::Reject);
        assert_eq!(m.index, 0);
        assert_eq!(m.policy.action, Action::Reject);
        assert_eq!(
            rules.evaluate(&web(), true),
            Verdict::Rejected(Some(FlowPolicy::reject("P2")))
        );
    }

    #[test]
    fn test_first_rule_in_order_wins() {
        let rules = RuleSet::new(
            vec![],
            vec![
                rule("env", "prod", FlowPolicy::accept("first")),
                rule("app", "web", FlowPolicy::accept("second")),
                Rule::new(TagSelector::default(), FlowPolicy::accept("catch-all")),
            ],
        );

        let m = rules.search(&web()).unwrap();
        assert_eq!(m.index, 1);
        assert_eq!(m.policy.policy_id, "second");
    }

    #[test]
    fn test_no_match_under_mutual_auth_is_deny() {
        let rules = RuleSet::new(vec![], vec![rule("app", "db", FlowPolicy::accept("P1"))]);
        assert!(rules.search(&web()).is_none());
        assert_eq!(rules.evaluate(&web(), true), Verdict::Rejected(None));
        assert_eq!(rules.evaluate(&web(), false), Verdict::Accepted(None));
    }

    #[test]
    fn test_empty_rule_set_never_matches() {
        let rules = RuleSet::default();
        assert!(rules.is_empty());
        assert!(rules.search(&web()).is_none());
        assert!(rules.search(&TagSet::new()).is_none());
    }

    #[test]
    fn test_deserialize_rule_set() {
        let rules: RuleSet = toml::from_str(
            r#"
            [[accept]]
            policy_id = "P1"
            action = "accept"
            selector = [{ key = "app", operator = "equal", values = ["web"] }]
            "#,
        )
        .unwrap();

        assert!(rules.reject.is_empty());
        assert_eq!(rules.accept[0].policy, FlowPolicy::accept("P1"));
        assert!(rules.evaluate(&web(), true).is_accepted());
    }

    #[test]
    fn test_accept_action_in_reject_list_still_refuses() {
        let rules = RuleSet::new(
            vec![Rule::new(
                TagSelector::new(vec![Clause::exists("app")]),
                FlowPolicy::accept("misfiled"),
            )],
            vec![rule("app", "web", FlowPolicy::accept("P1"))],
        );

        assert_eq!(
            rules.evaluate(&web(), true),
            Verdict::Rejected(Some(FlowPolicy::accept("misfiled")))
        );
        assert_eq!(rules.mislisted(), vec![(RuleList::Reject, 0)]);
    }

    #[test]
    fn test_reject_action_in_accept_list_refuses() {
        let rules = RuleSet::new(vec![], vec![rule("app", "web", FlowPolicy::reject("P3"))]);

        assert_eq!(
            rules.evaluate(&web(), false),
            Verdict::Rejected(Some(FlowPolicy::reject("P3")))
        );
        assert_eq!(rules.mislisted(), vec![(RuleList::Accept, 0)]);
    }
}
