//! Password Policy
//!
//! Configurable minimum-count rules for new passwords. `test` returns every
//! violated rule so callers can surface the full list at once; rule scoring
//! beyond simple counts is a collaborator concern, not part of this crate.

/// A single policy rule a password can violate
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PolicyRule {
    /// Below the minimum character length
    Length,
    /// Too few uppercase characters
    Uppercase,
    /// Too few digits
    Numbers,
    /// Too few special (non-alphanumeric) characters
    Special,
    /// Too few non-letter characters
    NonLetters,
}

/// Minimum-count requirements applied to every new password
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PasswordPolicy {
    length: usize,
    uppercase: usize,
    numbers: usize,
    special: usize,
    nonletters: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: 8,
            uppercase: 2,
            numbers: 2,
            special: 2,
            nonletters: 2,
        }
    }
}

impl PasswordPolicy {
    /// The default policy: 8+ chars, 2+ uppercase, 2+ digits, 2+ special,
    /// 2+ non-letters
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum character length
    pub fn length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Sets the minimum number of uppercase characters
    pub fn uppercase(mut self, uppercase: usize) -> Self {
        self.uppercase = uppercase;
        self
    }

    /// Sets the minimum number of digits
    pub fn numbers(mut self, numbers: usize) -> Self {
        self.numbers = numbers;
        self
    }

    /// Sets the minimum number of special characters
    pub fn special(mut self, special: usize) -> Self {
        self.special = special;
        self
    }

    /// Sets the minimum number of non-letter characters
    pub fn nonletters(mut self, nonletters: usize) -> Self {
        self.nonletters = nonletters;
        self
    }

    /// Returns every rule the password violates; an empty list means the
    /// password is acceptable
    pub fn test(&self, password: &str) -> Vec<PolicyRule> {
        let mut fails = Vec::new();

        if password.chars().count() < self.length {
            fails.push(PolicyRule::Length);
        }

        if password.chars().filter(|c| c.is_uppercase()).count() < self.uppercase {
            fails.push(PolicyRule::Uppercase);
        }

        if password.chars().filter(|c| c.is_ascii_digit()).count() < self.numbers {
            fails.push(PolicyRule::Numbers);
        }

        if password.chars().filter(|c| !c.is_alphanumeric()).count() < self.special {
            fails.push(PolicyRule::Special);
        }

        if password.chars().filter(|c| !c.is_alphabetic()).count() < self.nonletters {
            fails.push(PolicyRule::NonLetters);
        }

        fails
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("S]Q}67=uLetG{r,_8{")]
    #[case("#!K2&33?e%@Pv3_Q")]
    #[case("ZRvTP72g-VwX3@\\H")]
    fn default_policy_accepts(#[case] password: &str) {
        assert!(PasswordPolicy::default().test(password).is_empty());
    }

    #[rstest]
    #[case("1234hh$", &[PolicyRule::Length, PolicyRule::Uppercase, PolicyRule::Special])]
    #[case("", &[PolicyRule::Length, PolicyRule::Uppercase, PolicyRule::Numbers, PolicyRule::Special, PolicyRule::NonLetters])]
    #[case("alllowercase", &[PolicyRule::Uppercase, PolicyRule::Numbers, PolicyRule::Special, PolicyRule::NonLetters])]
    fn default_policy_rejects(#[case] password: &str, #[case] expected: &[PolicyRule]) {
        assert_eq!(PasswordPolicy::default().test(password), expected);
    }

    #[test]
    fn relaxed_policy() {
        let policy = PasswordPolicy::new()
            .length(4)
            .uppercase(0)
            .numbers(0)
            .special(0)
            .nonletters(0);
        assert!(policy.test("abcd").is_empty());
        assert_eq!(policy.test("abc"), vec![PolicyRule::Length]);
    }
}
