//! Crate-wide error kinds, one variant per error kind named in the spec's
//! error handling design.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("AUTH_MISSING: {0}")]
    AuthMissing(String),

    #[error("AUTH_INVALID: {0}")]
    AuthInvalid(String),

    #[error("RATE_LIMITED: {0}")]
    RateLimited(String),

    #[error("TOOL_UNKNOWN: {0}")]
    ToolUnknown(String),

    #[error("TOOL_SCHEMA_INVALID: {0}")]
    ToolSchemaInvalid(String),

    #[error("TOOL_POLICY_BLOCKED: {0}")]
    ToolPolicyBlocked(String),

    #[error("TOOL_APPROVAL_REQUIRED: {0}")]
    ToolApprovalRequired(String),

    #[error("TOOL_EXEC_DENIED: {0}")]
    ToolExecDenied(String),

    #[error("DM_POLICY_BLOCKED: {0}")]
    DmPolicyBlocked(String),

    #[error("GROUP_POLICY_BLOCKED: {0}")]
    GroupPolicyBlocked(String),

    #[error("ADAPTER_TRANSPORT: {0}")]
    AdapterTransport(String),

    #[error("ADAPTER_MALFORMED_FRAME: {0}")]
    AdapterMalformedFrame(String),

    #[error("ADAPTER_TIMEOUT: {0}")]
    AdapterTimeout(String),

    #[error("SSRF_BLOCKED: {0}")]
    SsrfBlocked(String),

    #[error("DNS_REBINDING: {0}")]
    DnsRebinding(String),

    #[error("TURN_BUDGET_EXCEEDED: {0}")]
    TurnBudgetExceeded(String),

    #[error("BUILD_RECOVERY_TIMEOUT: {0}")]
    BuildRecoveryTimeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// The stable kind string, used for logging and tests that assert on
    /// "which kind fired" without matching the full message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthMissing(_) => "AUTH_MISSING",
            Self::AuthInvalid(_) => "AUTH_INVALID",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::ToolUnknown(_) => "TOOL_UNKNOWN",
            Self::ToolSchemaInvalid(_) => "TOOL_SCHEMA_INVALID",
            Self::ToolPolicyBlocked(_) => "TOOL_POLICY_BLOCKED",
            Self::ToolApprovalRequired(_) => "TOOL_APPROVAL_REQUIRED",
            Self::ToolExecDenied(_) => "TOOL_EXEC_DENIED",
            Self::DmPolicyBlocked(_) => "DM_POLICY_BLOCKED",
            Self::GroupPolicyBlocked(_) => "GROUP_POLICY_BLOCKED",
            Self::AdapterTransport(_) => "ADAPTER_TRANSPORT",
            Self::AdapterMalformedFrame(_) => "ADAPTER_MALFORMED_FRAME",
            Self::AdapterTimeout(_) => "ADAPTER_TIMEOUT",
            Self::SsrfBlocked(_) => "SSRF_BLOCKED",
            Self::DnsRebinding(_) => "DNS_REBINDING",
            Self::TurnBudgetExceeded(_) => "TURN_BUDGET_EXCEEDED",
            Self::BuildRecoveryTimeout(_) => "BUILD_RECOVERY_TIMEOUT",
            Self::Other(_) => "OTHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_display_prefix() {
        let err = CoreError::ToolSchemaInvalid("bad args".into());
        assert_eq!(err.kind(), "TOOL_SCHEMA_INVALID");
        assert!(err.to_string().starts_with("TOOL_SCHEMA_INVALID"));
    }

    #[test]
    fn other_wraps_anyhow() {
        let source = anyhow::anyhow!("boom");
        let err: CoreError = source.into();
        assert_eq!(err.kind(), "OTHER");
    }
}
