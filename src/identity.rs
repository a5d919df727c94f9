//! Cluster identity: name and admin credentials for one run

use std::fmt;
use std::sync::OnceLock;

use rand::seq::SliceRandom;
use rand::Rng;

const NAME_SUFFIX_LEN: usize = 6;
const PASSWORD_LEN: usize = 16;
const FAKE_EMAIL_DOMAIN: &str = "example.com";

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!#%+-_=";

/// Name and admin credentials shared by every provisioning call of a run.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    /// Cluster name, also the build directory name
    pub name: String,
    /// Console admin email
    pub admin_email: String,
    /// Console admin password
    pub admin_password: String,
}

impl fmt::Debug for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterIdentity")
            .field("name", &self.name)
            .field("admin_email", &self.admin_email)
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

/// Produces the run's identity, honouring any overrides.
///
/// The first call fixes the identity; later calls return the same value.
#[derive(Default)]
pub struct IdentityGenerator {
    prefix: String,
    name: Option<String>,
    admin_email: Option<String>,
    admin_password: Option<String>,
    generated: OnceLock<ClusterIdentity>,
}

impl IdentityGenerator {
    /// Generator deriving names from `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Use a fixed cluster name instead of a generated one
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Use a fixed admin email
    pub fn with_admin_email(mut self, email: Option<String>) -> Self {
        self.admin_email = email;
        self
    }

    /// Use a fixed admin password
    pub fn with_admin_password(mut self, password: Option<String>) -> Self {
        self.admin_password = password;
        self
    }

    /// The run's identity, generated on first use
    pub fn identity(&self) -> &ClusterIdentity {
        self.generated.get_or_init(|| ClusterIdentity {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| generate_name(&self.prefix)),
            admin_email: self
                .admin_email
                .clone()
                .unwrap_or_else(generate_fake_email),
            admin_password: self
                .admin_password
                .clone()
                .unwrap_or_else(generate_password),
        })
    }
}

/// `<prefix>-<suffix>` in lowercase; object storage bucket names reject
/// upper case.
pub fn generate_name(prefix: &str) -> String {
    let prefix: String = prefix
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let prefix = prefix.trim_matches('-');
    let suffix = random_from(&[LOWER, DIGITS].concat(), NAME_SUFFIX_LEN);

    if prefix.is_empty() {
        suffix
    } else {
        format!("{}-{}", prefix, suffix)
    }
}

/// Throwaway admin email
pub fn generate_fake_email() -> String {
    format!(
        "{}@{}",
        random_from(&[LOWER, DIGITS].concat(), 10),
        FAKE_EMAIL_DOMAIN
    )
}

/// Password with at least one character from every class
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];
    let all = classes.concat();

    let mut chars: Vec<u8> = classes
        .iter()
        .filter_map(|class| class.choose(&mut rng).copied())
        .collect();
    while chars.len() < PASSWORD_LEN {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}

fn random_from(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_generated_once() {
        let generator = IdentityGenerator::new("smoke");
        let first = generator.identity().clone();
        let second = generator.identity().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn overrides_are_honoured() {
        let generator = IdentityGenerator::new("smoke")
            .with_name(Some("static-name".to_string()))
            .with_admin_email(Some("admin@example.org".to_string()))
            .with_admin_password(None);
        let identity = generator.identity();
        assert_eq!(identity.name, "static-name");
        assert_eq!(identity.admin_email, "admin@example.org");
        assert_eq!(identity.admin_password.len(), PASSWORD_LEN);
    }

    #[test]
    fn names_are_lowercase_with_suffix() {
        let name = generate_name("AWS_Smoke");
        assert!(name.starts_with("aws-smoke-"));
        assert_eq!(name.len(), "aws-smoke-".len() + NAME_SUFFIX_LEN);
        assert_eq!(name, name.to_ascii_lowercase());
    }

    #[test]
    fn empty_prefix_yields_bare_suffix() {
        assert_eq!(generate_name("").len(), NAME_SUFFIX_LEN);
    }

    #[test]
    fn password_covers_every_class() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.bytes().any(|b| LOWER.contains(&b)));
        assert!(password.bytes().any(|b| UPPER.contains(&b)));
        assert!(password.bytes().any(|b| DIGITS.contains(&b)));
        assert!(password.bytes().any(|b| SYMBOLS.contains(&b)));
    }

    #[test]
    fn debug_redacts_password() {
        let identity = ClusterIdentity {
            name: "c".to_string(),
            admin_email: "a@example.com".to_string(),
            admin_password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", identity);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
