use rust_decimal::Decimal;
use uuid::Uuid;

/// Opaque external payment capability. The wire protocol lives outside the
/// core; we only hand out hosted links and consume callback verdicts.
pub trait PaymentGateway: Send + Sync {
    fn create_payment_link(&self, amount: Decimal, order_id: Uuid, customer_email: &str)
    -> String;
    fn verify_callback(&self, signature: &str, payload: &str) -> bool;
}

/// Gateway stand-in that settles synchronously. Links are deterministic so
/// tests can assert on them.
pub struct SimulatedGateway {
    base_url: String,
}

impl SimulatedGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl PaymentGateway for SimulatedGateway {
    fn create_payment_link(
        &self,
        amount: Decimal,
        order_id: Uuid,
        customer_email: &str,
    ) -> String {
        format!(
            "{}/checkout/{}?amount={}&email={}",
            self.base_url, order_id, amount, customer_email
        )
    }

    fn verify_callback(&self, signature: &str, _payload: &str) -> bool {
        !signature.is_empty()
    }
}

/// Fire-and-forget notification channel; no delivery guarantee.
pub trait Notifier: Send + Sync {
    fn send(&self, email: &str, subject: &str, body: &str);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, email: &str, subject: &str, body: &str) {
        tracing::info!(to = %email, subject = %subject, body_len = body.len(), "notification sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_links_are_deterministic() {
        let gateway = SimulatedGateway::new("https://pay.test");
        let order_id = Uuid::new_v4();
        let link = gateway.create_payment_link(Decimal::from(42), order_id, "a@b.test");
        assert_eq!(
            link,
            format!("https://pay.test/checkout/{order_id}?amount=42&email=a@b.test")
        );
    }

    #[test]
    fn callback_verdict_requires_a_signature() {
        let gateway = SimulatedGateway::new("https://pay.test");
        assert!(gateway.verify_callback("sig-abc", "{}"));
        assert!(!gateway.verify_callback("", "{}"));
    }
}
