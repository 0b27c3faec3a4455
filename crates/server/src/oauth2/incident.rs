//! Security incident sink.
//!
//! Incidents are structured tracing events: refresh reuse, policy rule
//! violations, disabled-client or disabled-user access attempts, key
//! revocations. Emission is fire-and-forget and can never fail or block
//! the issuance path.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    High,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
        }
    }
}

#[derive(Clone, Default)]
pub struct IncidentSink;

impl IncidentSink {
    pub fn new() -> Self {
        Self
    }

    pub fn log_incident(
        &self,
        kind: &str,
        severity: Severity,
        subject: Option<&str>,
        client: Option<&str>,
        detail: &str,
    ) {
        match severity {
            Severity::High => tracing::warn!(
                target: "security",
                incident = kind,
                severity = severity.as_str(),
                subject = subject.unwrap_or("-"),
                client = client.unwrap_or("-"),
                detail,
                "security incident"
            ),
            _ => tracing::info!(
                target: "security",
                incident = kind,
                severity = severity.as_str(),
                subject = subject.unwrap_or("-"),
                client = client.unwrap_or("-"),
                detail,
                "security incident"
            ),
        }
    }

    /// Convenience wrapper for policy-rule violations.
    pub fn rule_violation(&self, rule: &str, client: &str, detail: &str) {
        self.log_incident("policy_rule_violation", Severity::Warning, None, Some(client), &format!("{rule}: {detail}"));
    }
}
