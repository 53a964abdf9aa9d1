//! Human-friendly names for peer ids, stable across restarts.

use sha2::{Digest, Sha256};

const ADJECTIVES: [&str; 32] = [
    "agile", "bold", "bright", "calm", "clever", "curious", "daring", "eager",
    "fierce", "gentle", "giant", "graceful", "hardy", "humble", "jolly", "keen",
    "lively", "lucky", "mighty", "nimble", "noisy", "patient", "playful", "quick",
    "quiet", "rapid", "shy", "sleek", "sly", "swift", "tame", "wild",
];

const ANIMALS: [&str; 32] = [
    "albatross", "badger", "beaver", "bison", "camel", "cheetah", "crane", "dingo",
    "dolphin", "eagle", "falcon", "ferret", "gecko", "heron", "ibis", "jackal",
    "koala", "lemur", "lynx", "mole", "newt", "ocelot", "otter", "owl",
    "panda", "puffin", "raven", "salmon", "tapir", "toad", "walrus", "yak",
];

/// `adjective-adjective-animal` derived from the peer id.
pub fn display_name(peer_id: &str) -> String {
    let digest = Sha256::digest(peer_id.as_bytes());
    let pick = |byte: u8, words: &[&'static str]| words[byte as usize % words.len()];
    format!(
        "{}-{}-{}",
        pick(digest[0], &ADJECTIVES),
        pick(digest[1], &ADJECTIVES),
        pick(digest[2], &ANIMALS)
    )
}
