//! Subdomain validation and random tunnel id generation.

use rand::Rng;

pub const INVALID_SUBDOMAIN_MESSAGE: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cosmic", "crisp", "eager", "fancy", "fuzzy", "gentle", "happy",
    "jolly", "keen", "lively", "lucky", "mellow", "merry", "nimble", "proud", "quick", "quiet",
    "rapid", "shiny", "sleek", "snappy", "solid", "spry", "stout", "sunny", "swift", "tidy",
    "vivid", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dingo", "falcon", "ferret", "gecko", "heron", "ibex",
    "jackal", "koala", "lemur", "lynx", "marmot", "marten", "moose", "newt", "ocelot", "otter",
    "panda", "pelican", "puffin", "quokka", "raven", "seal", "shrew", "stoat", "tapir", "toucan",
    "walrus", "wombat",
];

/// Generates a human-readable tunnel id, always valid per [`is_valid_subdomain`].
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        ANIMALS[rng.gen_range(0..ANIMALS.len())],
        rng.gen_range(10..100),
    )
}

/// Checks a requested subdomain against the tunnel id rules: lowercase
/// alphanumeric labels, hyphens allowed internally, bounded length.
pub fn is_valid_subdomain(id: &str) -> bool {
    fn alnum(c: u8) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }

    let b = id.as_bytes();
    let plain = (4..=63).contains(&b.len()) && b.iter().all(|&c| alnum(c));
    let hyphenated = (6..=65).contains(&b.len())
        && alnum(b[0])
        && alnum(b[b.len() - 1])
        && b[1..b.len() - 1].iter().all(|&c| alnum(c) || c == b'-');
    plain || hyphenated
}
