//! crates/storybook_core/src/ledger.rs
//!
//! Credit accounting: prices, balance pre-checks and ledger entries. The atomic
//! application of an entry is done by the store together with the work it pays for.

use crate::domain::{BookStatus, LedgerEntry, PointHistory, PointReason, User, VisibilityChange};
use crate::ports::{PortError, PortResult};
use crate::studio::BookStudio;
use tracing::info;
use uuid::Uuid;

/// Credit prices and rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    pub cost_per_page: i64,
    pub regenerate_cost: i64,
    pub signup_bonus: i64,
    pub public_book_reward: i64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            cost_per_page: 15,
            regenerate_cost: 10,
            signup_bonus: 100,
            public_book_reward: 30,
        }
    }
}

impl Pricing {
    /// Body pages are charged; the cover is free.
    pub fn generation_cost(&self, page_count: u32) -> i64 {
        i64::from(page_count) * self.cost_per_page
    }
}

impl LedgerEntry {
    pub fn debit(user_id: Uuid, amount: i64, reason: PointReason) -> Self {
        Self {
            user_id,
            delta: -amount,
            reason,
            book_id: None,
            page_id: None,
        }
    }

    pub fn credit(user_id: Uuid, amount: i64, reason: PointReason) -> Self {
        Self {
            user_id,
            delta: amount,
            reason,
            book_id: None,
            page_id: None,
        }
    }

    pub fn for_book(mut self, book_id: Uuid) -> Self {
        self.book_id = Some(book_id);
        self
    }

    pub fn for_page(mut self, page_id: Uuid) -> Self {
        self.page_id = Some(page_id);
        self
    }

    /// The balance after applying this entry, or the insufficient-credit error.
    pub fn apply_to(&self, balance: i64) -> PortResult<i64> {
        let next = balance + self.delta;
        if next < 0 {
            return Err(PortError::InsufficientCredits {
                required: -self.delta,
                current: balance,
            });
        }
        Ok(next)
    }
}

/// Fails with `InsufficientCredits` unless `balance` covers `required`.
pub fn ensure_affordable(balance: i64, required: i64) -> PortResult<()> {
    if balance < required {
        return Err(PortError::InsufficientCredits {
            required,
            current: balance,
        });
    }
    Ok(())
}

impl BookStudio {
    /// Reads the balance and checks it against `cost` before any paid work starts.
    pub async fn precheck_balance(&self, user_id: Uuid, cost: i64) -> PortResult<User> {
        let user = self.db.get_user(user_id).await?;
        ensure_affordable(user.points, cost)?;
        Ok(user)
    }

    /// Current balance and the full history behind it, newest first.
    pub async fn point_statement(&self, user_id: Uuid) -> PortResult<(User, Vec<PointHistory>)> {
        let user = self.db.get_user(user_id).await?;
        let history = self.db.get_point_history(user_id).await?;
        Ok((user, history))
    }

    /// Changes a book's visibility. The first time a book becomes public its owner
    /// is credited once; later toggles never pay again.
    pub async fn set_visibility(
        &self,
        user_id: Uuid,
        book_id: Uuid,
        status: BookStatus,
    ) -> PortResult<VisibilityChange> {
        let book = self.owned_book(user_id, book_id).await?;
        let reward = (status == BookStatus::Public && !book.public_reward_granted).then(|| {
            LedgerEntry::credit(
                user_id,
                self.settings.pricing.public_book_reward,
                PointReason::PublicBookReward,
            )
            .for_book(book_id)
        });

        let change = self.db.update_book_visibility(book_id, status, reward).await?;
        if change.rewarded {
            info!(%book_id, %user_id, "Public book reward granted");
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_cost_is_per_body_page() {
        assert_eq!(Pricing::default().generation_cost(5), 75);
        assert_eq!(Pricing::default().generation_cost(10), 150);
    }

    #[test]
    fn debit_that_would_go_negative_is_refused() {
        let entry = LedgerEntry::debit(Uuid::new_v4(), 150, PointReason::InitialGeneration);
        match entry.apply_to(50) {
            Err(PortError::InsufficientCredits { required, current }) => {
                assert_eq!(required, 150);
                assert_eq!(current, 50);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(entry.apply_to(150).unwrap(), 0);
    }

    #[test]
    fn precheck_reports_amounts() {
        assert!(ensure_affordable(100, 75).is_ok());
        assert!(matches!(
            ensure_affordable(50, 150),
            Err(PortError::InsufficientCredits { required: 150, current: 50 })
        ));
    }
}
