//! Price identifier to plan tier mapping

use quotagate_shared::PlanTier;

/// Stripe price identifiers for each paid tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceIds {
    pub monthly: String,
    pub yearly: String,
}

/// Maps provider prices to plan tiers and back.
#[derive(Debug, Clone)]
pub struct PlanResolver {
    prices: PriceIds,
}

impl PlanResolver {
    pub fn new(prices: PriceIds) -> Self {
        Self { prices }
    }

    /// Tier for an active subscription's price.
    ///
    /// Unrecognized prices resolve to Monthly so a paying customer is never locked out,
    /// and each occurrence is raised on the `billing_alert` target.
    pub fn resolve_plan(&self, price_id: Option<&str>) -> PlanTier {
        match price_id {
            Some(id) if id == self.prices.yearly => PlanTier::Yearly,
            Some(id) if id == self.prices.monthly => PlanTier::Monthly,
            other => {
                tracing::warn!(
                    target: "billing_alert",
                    price_id = ?other,
                    "Unrecognized price on active subscription, falling back to monthly plan"
                );
                PlanTier::Monthly
            }
        }
    }

    /// Price to use when opening a checkout for `tier`. Free has no price.
    pub fn price_for(&self, tier: PlanTier) -> Option<&str> {
        match tier {
            PlanTier::Free => None,
            PlanTier::Monthly => Some(&self.prices.monthly),
            PlanTier::Yearly => Some(&self.prices.yearly),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PlanResolver {
        PlanResolver::new(PriceIds {
            monthly: "price_monthly".to_string(),
            yearly: "price_yearly".to_string(),
        })
    }

    #[test]
    fn test_resolve_known_prices() {
        let resolver = resolver();
        assert_eq!(resolver.resolve_plan(Some("price_monthly")), PlanTier::Monthly);
        assert_eq!(resolver.resolve_plan(Some("price_yearly")), PlanTier::Yearly);
    }

    #[test]
    fn test_unknown_price_falls_back_to_monthly() {
        let resolver = resolver();
        assert_eq!(resolver.resolve_plan(Some("price_legacy")), PlanTier::Monthly);
        assert_eq!(resolver.resolve_plan(None), PlanTier::Monthly);
    }

    #[test]
    fn test_price_for_tier() {
        let resolver = resolver();
        assert_eq!(resolver.price_for(PlanTier::Free), None);
        assert_eq!(resolver.price_for(PlanTier::Monthly), Some("price_monthly"));
        assert_eq!(resolver.price_for(PlanTier::Yearly), Some("price_yearly"));
    }
}
