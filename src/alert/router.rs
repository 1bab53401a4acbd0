//! Walking the recipients an alert goes to
//!
//! Rules are tried in file order. For each rule whose criteria match, its
//! recipients are tried in order with their own criteria (evaluated in the
//! context of the rule). A recipient marked `STOP` ends the walk.

use super::criteria::{MatchContext, MatchNotes, matches};
use super::rules::{Recipient, Rule, RuleSet};
use super::tracker::ActiveAlert;

/// Resumable position in the rule set
pub struct RecipientCursor<'r> {
    rules: &'r RuleSet,
    rule: usize,
    /// Next recipient to try within `rule`; `None` before the first call
    recipient: Option<usize>,
    stopped: bool,
}

impl<'r> RecipientCursor<'r> {
    pub fn new(rules: &'r RuleSet) -> Self {
        Self {
            rules,
            rule: 0,
            recipient: None,
            stopped: false,
        }
    }

    /// The next matching recipient and the rule it belongs to.
    pub fn next(
        &mut self,
        alert: &ActiveAlert,
        ctx: &MatchContext,
        notes: &mut MatchNotes,
    ) -> Option<(&'r Rule, &'r Recipient)> {
        if self.stopped {
            return None;
        }
        let set: &'r RuleSet = self.rules;
        let rules = set.rules();
        let mut rule_notes = MatchNotes::default();

        loop {
            let index = match self.recipient {
                Some(index) => index,
                None => {
                    // find the next rule whose own criteria match
                    let found = rules[self.rule..]
                        .iter()
                        .position(|r| matches(alert, &r.criteria, None, ctx, &mut rule_notes));
                    let Some(found) = found else {
                        self.rule = rules.len();
                        absorb(notes, rule_notes);
                        return None;
                    };
                    self.rule += found;
                    0
                }
            };

            let rule = &rules[self.rule];
            let Some(recipient) = rule.recipients.get(index) else {
                self.rule += 1;
                self.recipient = None;
                continue;
            };
            self.recipient = Some(index + 1);

            if matches(alert, &recipient.criteria, Some(&rule.criteria), ctx, notes) {
                self.stopped = recipient.stop;
                absorb(notes, rule_notes);
                return Some((rule, recipient));
            }
        }
    }
}

fn absorb(notes: &mut MatchNotes, rule_notes: MatchNotes) {
    notes.any_match |= rule_notes.any_match;
    if let Some(at) = rule_notes.retry_at {
        notes.retry_at = Some(notes.retry_at.map_or(at, |t| t.min(at)));
    }
}

/// Whether anyone would be notified, and whether any recipient passed the
/// name filters at all.
pub fn have_recipient(rules: &RuleSet, alert: &ActiveAlert, ctx: &MatchContext) -> (bool, bool) {
    let mut notes = MatchNotes::default();
    let found = RecipientCursor::new(rules)
        .next(alert, ctx, &mut notes)
        .is_some();
    (found, notes.any_match)
}

/// Every recipient the alert would go to right now.
pub fn recipients<'r>(
    rules: &'r RuleSet,
    alert: &ActiveAlert,
    ctx: &MatchContext,
) -> Vec<(&'r Rule, &'r Recipient)> {
    let mut cursor = RecipientCursor::new(rules);
    let mut notes = MatchNotes::default();
    std::iter::from_fn(|| cursor.next(alert, ctx, &mut notes)).collect()
}
