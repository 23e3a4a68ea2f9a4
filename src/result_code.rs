//! LDAP result codes (RFC 4511 Appendix A, RFC 3909, RFC 4533).

pub const SUCCESS: u32 = 0;
pub const OPERATIONS_ERROR: u32 = 1;
pub const PROTOCOL_ERROR: u32 = 2;
pub const TIME_LIMIT_EXCEEDED: u32 = 3;
pub const SIZE_LIMIT_EXCEEDED: u32 = 4;
pub const COMPARE_FALSE: u32 = 5;
pub const COMPARE_TRUE: u32 = 6;
pub const AUTH_METHOD_NOT_SUPPORTED: u32 = 7;
pub const STRONGER_AUTH_REQUIRED: u32 = 8;
pub const REFERRAL: u32 = 10;
pub const ADMIN_LIMIT_EXCEEDED: u32 = 11;
pub const UNAVAILABLE_CRITICAL_EXTENSION: u32 = 12;
pub const CONFIDENTIALITY_REQUIRED: u32 = 13;
pub const SASL_BIND_IN_PROGRESS: u32 = 14;
pub const NO_SUCH_ATTRIBUTE: u32 = 16;
pub const UNDEFINED_ATTRIBUTE_TYPE: u32 = 17;
pub const INAPPROPRIATE_MATCHING: u32 = 18;
pub const CONSTRAINT_VIOLATION: u32 = 19;
pub const ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
pub const INVALID_ATTRIBUTE_SYNTAX: u32 = 21;
pub const NO_SUCH_OBJECT: u32 = 32;
pub const ALIAS_PROBLEM: u32 = 33;
pub const INVALID_DN_SYNTAX: u32 = 34;
pub const ALIAS_DEREFERENCING_PROBLEM: u32 = 36;
pub const INAPPROPRIATE_AUTHENTICATION: u32 = 48;
pub const INVALID_CREDENTIALS: u32 = 49;
pub const INSUFFICIENT_ACCESS_RIGHTS: u32 = 50;
pub const BUSY: u32 = 51;
pub const UNAVAILABLE: u32 = 52;
pub const UNWILLING_TO_PERFORM: u32 = 53;
pub const LOOP_DETECT: u32 = 54;
pub const NAMING_VIOLATION: u32 = 64;
pub const OBJECT_CLASS_VIOLATION: u32 = 65;
pub const NOT_ALLOWED_ON_NON_LEAF: u32 = 66;
pub const NOT_ALLOWED_ON_RDN: u32 = 67;
pub const ENTRY_ALREADY_EXISTS: u32 = 68;
pub const OBJECT_CLASS_MODS_PROHIBITED: u32 = 69;
pub const AFFECTS_MULTIPLE_DSAS: u32 = 71;
pub const OTHER: u32 = 80;
pub const CANCELED: u32 = 118;
pub const NO_SUCH_OPERATION: u32 = 119;
pub const TOO_LATE: u32 = 120;
pub const CANNOT_CANCEL: u32 = 121;
pub const ASSERTION_FAILED: u32 = 122;
pub const AUTHORIZATION_DENIED: u32 = 123;
pub const SYNC_REFRESH_REQUIRED: u32 = 4096;

/// Codes that are never turned into an operation error on their own.
pub const NON_ERROR_CODES: [u32; 5] = [
    SUCCESS,
    COMPARE_FALSE,
    COMPARE_TRUE,
    REFERRAL,
    SASL_BIND_IN_PROGRESS,
];

pub fn is_non_error(code: u32) -> bool {
    NON_ERROR_CODES.contains(&code)
}

/// Symbolic name for logs and error messages.
pub fn name(code: u32) -> &'static str {
    match code {
        SUCCESS => "success",
        OPERATIONS_ERROR => "operationsError",
        PROTOCOL_ERROR => "protocolError",
        TIME_LIMIT_EXCEEDED => "timeLimitExceeded",
        SIZE_LIMIT_EXCEEDED => "sizeLimitExceeded",
        COMPARE_FALSE => "compareFalse",
        COMPARE_TRUE => "compareTrue",
        AUTH_METHOD_NOT_SUPPORTED => "authMethodNotSupported",
        STRONGER_AUTH_REQUIRED => "strongerAuthRequired",
        REFERRAL => "referral",
        ADMIN_LIMIT_EXCEEDED => "adminLimitExceeded",
        UNAVAILABLE_CRITICAL_EXTENSION => "unavailableCriticalExtension",
        CONFIDENTIALITY_REQUIRED => "confidentialityRequired",
        SASL_BIND_IN_PROGRESS => "saslBindInProgress",
        NO_SUCH_ATTRIBUTE => "noSuchAttribute",
        UNDEFINED_ATTRIBUTE_TYPE => "undefinedAttributeType",
        INAPPROPRIATE_MATCHING => "inappropriateMatching",
        CONSTRAINT_VIOLATION => "constraintViolation",
        ATTRIBUTE_OR_VALUE_EXISTS => "attributeOrValueExists",
        INVALID_ATTRIBUTE_SYNTAX => "invalidAttributeSyntax",
        NO_SUCH_OBJECT => "noSuchObject",
        ALIAS_PROBLEM => "aliasProblem",
        INVALID_DN_SYNTAX => "invalidDNSyntax",
        ALIAS_DEREFERENCING_PROBLEM => "aliasDereferencingProblem",
        INAPPROPRIATE_AUTHENTICATION => "inappropriateAuthentication",
        INVALID_CREDENTIALS => "invalidCredentials",
        INSUFFICIENT_ACCESS_RIGHTS => "insufficientAccessRights",
        BUSY => "busy",
        UNAVAILABLE => "unavailable",
        UNWILLING_TO_PERFORM => "unwillingToPerform",
        LOOP_DETECT => "loopDetect",
        NAMING_VIOLATION => "namingViolation",
        OBJECT_CLASS_VIOLATION => "objectClassViolation",
        NOT_ALLOWED_ON_NON_LEAF => "notAllowedOnNonLeaf",
        NOT_ALLOWED_ON_RDN => "notAllowedOnRDN",
        ENTRY_ALREADY_EXISTS => "entryAlreadyExists",
        OBJECT_CLASS_MODS_PROHIBITED => "objectClassModsProhibited",
        AFFECTS_MULTIPLE_DSAS => "affectsMultipleDSAs",
        OTHER => "other",
        CANCELED => "canceled",
        NO_SUCH_OPERATION => "noSuchOperation",
        TOO_LATE => "tooLate",
        CANNOT_CANCEL => "cannotCancel",
        ASSERTION_FAILED => "assertionFailed",
        AUTHORIZATION_DENIED => "authorizationDenied",
        SYNC_REFRESH_REQUIRED => "e-syncRefreshRequired",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_error_codes() {
        for code in [SUCCESS, COMPARE_FALSE, COMPARE_TRUE, REFERRAL, SASL_BIND_IN_PROGRESS] {
            assert!(is_non_error(code));
        }
        for code in [OPERATIONS_ERROR, PROTOCOL_ERROR, INVALID_CREDENTIALS, NO_SUCH_OBJECT, CANCELED] {
            assert!(!is_non_error(code));
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(name(INVALID_CREDENTIALS), "invalidCredentials");
        assert_eq!(name(9999), "unknown");
    }
}
