//! Human-readable passphrases and the minimum passphrase policy.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;

use crate::config::CryptoConfig;
use crate::error::{CryptoError, Result};

/// 256 short, unambiguous words: each contributes 8 bits of entropy.
const WORDLIST: [&str; 256] = [
    "able", "acid", "aged", "also", "area", "army", "away", "baby",
    "back", "bald", "band", "bank", "barn", "base", "bath", "bead",
    "beam", "bean", "bear", "beef", "bell", "belt", "bench", "bike",
    "bird", "blue", "boat", "body", "bold", "bolt", "bone", "book",
    "boot", "bowl", "brave", "bread", "brick", "bride", "brook", "brush",
    "cabin", "cable", "cake", "calm", "camel", "camp", "canal", "candy",
    "cape", "card", "cargo", "carp", "cart", "cave", "cedar", "chair",
    "chalk", "charm", "chef", "chess", "chin", "cider", "city", "clam",
    "clay", "cliff", "clock", "cloud", "coal", "coast", "coin", "comet",
    "coral", "cord", "corn", "couch", "crab", "crane", "creek", "crow",
    "crown", "cube", "cup", "curl", "daisy", "dance", "dawn", "deck",
    "deer", "desk", "dial", "dime", "dock", "dove", "dune", "eagle",
    "earth", "easel", "echo", "elbow", "elm", "ember", "fable", "fairy",
    "farm", "fawn", "fern", "ferry", "field", "fig", "film", "flag",
    "flame", "flint", "flute", "foam", "fog", "fork", "fort", "fox",
    "frog", "frost", "fruit", "gable", "gate", "gear", "gem", "ghost",
    "giant", "glade", "globe", "glove", "goat", "gold", "goose", "grain",
    "grape", "grass", "gravel", "grove", "gull", "harbor", "harp", "hawk",
    "hazel", "heart", "hedge", "hill", "hive", "honey", "hook", "horn",
    "horse", "hotel", "house", "ice", "inlet", "iris", "iron", "ivory",
    "ivy", "jade", "jam", "jar", "jelly", "jewel", "judge", "juice",
    "kayak", "kettle", "key", "kite", "knee", "knot", "ladle", "lake",
    "lamp", "lark", "latch", "lava", "lawn", "leaf", "lemon", "lens",
    "lily", "lime", "linen", "lion", "llama", "lodge", "loom", "lotus",
    "lunar", "magnet", "mango", "maple", "marble", "marsh", "mask", "meadow",
    "melon", "mesa", "mill", "mint", "mirror", "moat", "moon", "moss",
    "moth", "mule", "nest", "nickel", "noble", "north", "nut", "oak",
    "oasis", "oat", "ocean", "olive", "onion", "opal", "orbit", "otter",
    "owl", "paddle", "palm", "panda", "paper", "peach", "pearl", "pebble",
    "pepper", "piano", "pilot", "pine", "plum", "pond", "poppy", "prism",
    "pulse", "quail", "quartz", "quill", "radio", "rain", "raven", "reef",
    "ridge", "river", "robin", "rocket", "rope", "rose", "ruby", "sable",
];

/// Random words joined with `-`, drawn from the OS RNG.
pub fn generate_secure_passphrase(word_count: usize) -> String {
    let mut rng = OsRng;
    (0..word_count.max(1))
        .filter_map(|_| WORDLIST.choose(&mut rng).copied())
        .collect::<Vec<_>>()
        .join("-")
}

/// Reject passphrases below the configured length or character variety.
pub fn check_passphrase_policy(passphrase: &str, config: &CryptoConfig) -> Result<()> {
    if passphrase.chars().count() < config.min_passphrase_len {
        return Err(CryptoError::WeakPassphrase("too short"));
    }
    let mut distinct: Vec<char> = passphrase.chars().collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < config.min_passphrase_distinct_chars {
        return Err(CryptoError::WeakPassphrase("too few distinct characters"));
    }
    Ok(())
}
