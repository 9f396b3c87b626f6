use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DEACTIVATION_ATTEMPTS: u32 = 5;

pub const BRUTE_FORCE_MESSAGE: &str =
    "possible brute-forcing detected: too many incorrect passphrases, files were sent immediately";

pub const DEACTIVATED_MESSAGE: &str = "transfer deactivated: files deleted and delivery cancelled";

/// What happens after the stored failure counter reaches `failures`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    Retry { attempts_remaining: u32 },
    /// Threshold crossed. The transfer is force-sent and no further
    /// attempts are accepted.
    ForceSend,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeactivationPolicy {
    pub max_attempts: u32,
}

impl Default for DeactivationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_DEACTIVATION_ATTEMPTS,
        }
    }
}

impl DeactivationPolicy {
    pub fn judge(&self, failures: u32) -> AttemptVerdict {
        if failures >= self.max_attempts {
            AttemptVerdict::ForceSend
        } else {
            AttemptVerdict::Retry {
                attempts_remaining: self.max_attempts - failures,
            }
        }
    }
}

pub fn incorrect_passphrase_message(attempts_remaining: u32) -> String {
    let noun = if attempts_remaining == 1 { "attempt" } else { "attempts" };
    format!("incorrect passphrase, {attempts_remaining} {noun} remaining")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_to_forced_send() {
        let policy = DeactivationPolicy::default();
        assert_eq!(policy.judge(1), AttemptVerdict::Retry { attempts_remaining: 4 });
        assert_eq!(policy.judge(4), AttemptVerdict::Retry { attempts_remaining: 1 });
        assert_eq!(policy.judge(5), AttemptVerdict::ForceSend);
        assert_eq!(policy.judge(9), AttemptVerdict::ForceSend);
    }

    #[test]
    fn message_pluralises_remaining_attempts() {
        assert_eq!(
            incorrect_passphrase_message(1),
            "incorrect passphrase, 1 attempt remaining"
        );
        assert_eq!(
            incorrect_passphrase_message(3),
            "incorrect passphrase, 3 attempts remaining"
        );
    }
}
