/// Turns a resource's base weight into the price charged for a hold.
pub trait PricingStrategy: Send + Sync {
    fn price(&self, base: f64) -> f64;
}

/// Charges the base price.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPricing;

impl PricingStrategy for StandardPricing {
    fn price(&self, base: f64) -> f64 {
        base
    }
}

/// Charges double.
#[derive(Debug, Clone, Copy, Default)]
pub struct PremiumPricing;

impl PricingStrategy for PremiumPricing {
    fn price(&self, base: f64) -> f64 {
        base * 2.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Multiplier(pub f64);

impl PricingStrategy for Multiplier {
    fn price(&self, base: f64) -> f64 {
        base * self.0
    }
}

impl<F> PricingStrategy for F
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    fn price(&self, base: f64) -> f64 {
        self(base)
    }
}
