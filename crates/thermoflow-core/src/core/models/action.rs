use super::complex::Strand;
use std::fmt;
use std::sync::Arc;

/// How an [`Action`] rule changes the energy of a base pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// The pair is not allowed.
    Forbid,
    /// The pair is assigned the rule's factor in place of its model energy.
    Flat,
    /// The rule's factor is added to the model energy.
    Bonus,
}

/// Rule evaluated for nucleotides `i < j` (indices over the concatenated
/// strands of the block being filled).
pub type ActionRule = dyn Fn(&[Strand], usize, usize) -> (f64, ActionKind) + Send + Sync;

/// Optional energy-bias override applied to every block of a submission.
///
/// Blocks built under an action are not interchangeable with unbiased
/// blocks, so a submission that carries one must disable the shared
/// complex cache.
#[derive(Clone)]
pub struct Action {
    name: String,
    rule: Arc<ActionRule>,
}

impl Action {
    pub fn new<F>(name: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&[Strand], usize, usize) -> (f64, ActionKind) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            rule: Arc::new(rule),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, strands: &[Strand], i: usize, j: usize) -> (f64, ActionKind) {
        (self.rule)(strands, i, j)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_is_evaluated_with_the_block_strands() {
        let action = Action::new("forbid-ends", |strands, i, j| {
            let last = strands.iter().map(Strand::len).sum::<usize>() - 1;
            if i == 0 && j == last {
                (0.0, ActionKind::Forbid)
            } else {
                (-1.0, ActionKind::Bonus)
            }
        });
        let strands = vec![Strand::new("ACGU").unwrap()];

        assert_eq!(action.evaluate(&strands, 0, 3), (0.0, ActionKind::Forbid));
        assert_eq!(action.evaluate(&strands, 1, 2), (-1.0, ActionKind::Bonus));
        assert_eq!(format!("{action:?}"), "Action { name: \"forbid-ends\" }");
    }
}
