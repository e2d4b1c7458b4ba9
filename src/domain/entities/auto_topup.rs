//! Auto-topup configuration and the pure decision of whether to replenish.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::wallet::Wallet;
use crate::app_error::{AppError, AppResult};

/// Closed set of conditions that can fire a top-up.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "auto_topup_trigger", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AutoTopupTrigger {
    /// Spendable `balance` dropped under the threshold's minimum.
    BalanceBelowThreshold,
}

/// Unit the top-up amount is expressed in.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "topup_denomination", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TopupDenomination {
    #[default]
    Currency,
    Credits,
}

/// Minimum balance and replenish amount, always present together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopupThreshold {
    min_balance: Decimal,
    amount: Decimal,
    denomination: TopupDenomination,
}

impl TopupThreshold {
    pub fn new(
        min_balance: Decimal,
        amount: Decimal,
        denomination: TopupDenomination,
    ) -> AppResult<Self> {
        if min_balance <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "auto_topup_min_balance must be positive".into(),
            ));
        }
        if amount <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "auto_topup_amount must be positive".into(),
            ));
        }
        Ok(Self {
            min_balance,
            amount,
            denomination,
        })
    }

    /// Both-or-neither construction from nullable parts.
    pub fn from_parts(
        min_balance: Option<Decimal>,
        amount: Option<Decimal>,
        denomination: TopupDenomination,
    ) -> AppResult<Option<Self>> {
        match (min_balance, amount) {
            (None, None) => Ok(None),
            (Some(min_balance), Some(amount)) => {
                Self::new(min_balance, amount, denomination).map(Some)
            }
            _ => Err(AppError::InvalidInput(
                "auto_topup_min_balance and auto_topup_amount must be set together".into(),
            )),
        }
    }

    pub fn min_balance(&self) -> Decimal {
        self.min_balance
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn denomination(&self) -> TopupDenomination {
        self.denomination
    }
}

/// A trigger without a threshold can never fire, so it is rejected up front.
pub fn validate_auto_topup(
    trigger: Option<AutoTopupTrigger>,
    threshold: Option<&TopupThreshold>,
) -> AppResult<()> {
    if trigger.is_some() && threshold.is_none() {
        return Err(AppError::InvalidInput(
            "auto_topup_trigger requires auto_topup_min_balance and auto_topup_amount".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopupDecision {
    NoAction,
    /// Credit `amount` (wallet currency) to the spendable balance.
    TopUp { amount: Decimal },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoTopupEvaluator;

impl AutoTopupEvaluator {
    pub fn evaluate(&self, wallet: &Wallet) -> AppResult<TopupDecision> {
        let (Some(trigger), Some(threshold)) = (wallet.auto_topup_trigger, wallet.auto_topup)
        else {
            return Ok(TopupDecision::NoAction);
        };

        let fired = match trigger {
            AutoTopupTrigger::BalanceBelowThreshold => wallet.balance < threshold.min_balance(),
        };
        if !fired {
            return Ok(TopupDecision::NoAction);
        }

        let amount = match threshold.denomination() {
            TopupDenomination::Currency => threshold.amount(),
            TopupDenomination::Credits => wallet.convert_credit_to_currency(threshold.amount())?,
        };
        Ok(TopupDecision::TopUp { amount })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_wallet;
    use rust_decimal_macros::dec;

    fn threshold(min: Decimal, amount: Decimal, denomination: TopupDenomination) -> TopupThreshold {
        TopupThreshold::new(min, amount, denomination).unwrap()
    }

    #[test]
    fn fires_below_minimum() {
        let wallet = create_test_wallet(|w| {
            w.balance = dec!(30);
            w.auto_topup_trigger = Some(AutoTopupTrigger::BalanceBelowThreshold);
            w.auto_topup = Some(threshold(dec!(50), dec!(200), TopupDenomination::Currency));
        });
        assert_eq!(
            AutoTopupEvaluator.evaluate(&wallet).unwrap(),
            TopupDecision::TopUp { amount: dec!(200) }
        );
    }

    #[test]
    fn at_minimum_does_not_fire() {
        let wallet = create_test_wallet(|w| {
            w.balance = dec!(50);
            w.auto_topup_trigger = Some(AutoTopupTrigger::BalanceBelowThreshold);
            w.auto_topup = Some(threshold(dec!(50), dec!(200), TopupDenomination::Currency));
        });
        assert_eq!(AutoTopupEvaluator.evaluate(&wallet).unwrap(), TopupDecision::NoAction);
    }

    #[test]
    fn threshold_without_trigger_is_inert() {
        let wallet = create_test_wallet(|w| {
            w.balance = dec!(0);
            w.auto_topup_trigger = None;
            w.auto_topup = Some(threshold(dec!(50), dec!(200), TopupDenomination::Currency));
        });
        assert_eq!(AutoTopupEvaluator.evaluate(&wallet).unwrap(), TopupDecision::NoAction);
    }

    #[test]
    fn credit_denominated_amount_is_converted() {
        let wallet = create_test_wallet(|w| {
            w.balance = dec!(1);
            w.conversion_rate = dec!(1.5);
            w.auto_topup_trigger = Some(AutoTopupTrigger::BalanceBelowThreshold);
            w.auto_topup = Some(threshold(dec!(10), dec!(100), TopupDenomination::Credits));
        });
        assert_eq!(
            AutoTopupEvaluator.evaluate(&wallet).unwrap(),
            TopupDecision::TopUp { amount: dec!(150.0) }
        );
    }

    #[test]
    fn unrepresentable_conversion_is_an_error() {
        let wallet = create_test_wallet(|w| {
            w.balance = dec!(0);
            w.conversion_rate = dec!(10);
            w.auto_topup_trigger = Some(AutoTopupTrigger::BalanceBelowThreshold);
            w.auto_topup = Some(threshold(dec!(10), Decimal::MAX, TopupDenomination::Credits));
        });
        assert!(matches!(
            AutoTopupEvaluator.evaluate(&wallet),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn credit_pool_is_not_counted_towards_the_minimum() {
        let wallet = create_test_wallet(|w| {
            w.balance = dec!(10);
            w.credit_balance = dec!(500);
            w.auto_topup_trigger = Some(AutoTopupTrigger::BalanceBelowThreshold);
            w.auto_topup = Some(threshold(dec!(50), dec!(25), TopupDenomination::Currency));
        });
        assert_eq!(
            AutoTopupEvaluator.evaluate(&wallet).unwrap(),
            TopupDecision::TopUp { amount: dec!(25) }
        );
    }

    #[test]
    fn parts_must_come_together() {
        assert!(TopupThreshold::from_parts(None, None, TopupDenomination::Currency)
            .unwrap()
            .is_none());
        assert!(matches!(
            TopupThreshold::from_parts(Some(dec!(5)), None, TopupDenomination::Currency),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            TopupThreshold::from_parts(Some(dec!(5)), Some(dec!(0)), TopupDenomination::Currency),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_auto_topup(Some(AutoTopupTrigger::BalanceBelowThreshold), None),
            Err(AppError::InvalidInput(_))
        ));
    }
}
