//! Package names: two lowercase words followed by a random lowercase tail.
//!
//! Names double as the public URL token, so they are restricted to `[a-z]+`
//! and must be unguessable. The words keep links readable; the tail carries
//! the entropy (12 letters, about 56 bits, on top of the word pair).

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bashful", "bouncy", "breezy", "bristly", "chilly", "cloudy", "crispy", "dapper",
    "dizzy", "drowsy", "dusky", "fizzy", "fluffy", "frosty", "fuzzy", "gentle", "giddy",
    "glassy", "grumpy", "hasty", "hollow", "humble", "itchy", "jolly", "jumpy", "lanky", "lucky",
    "mellow", "misty", "moody", "muddy", "nimble", "noisy", "odd", "plucky", "quiet", "rusty",
    "salty", "shady", "shiny", "silent", "sleepy", "sly", "snappy", "soggy", "spicy", "spooky",
    "stormy", "sunny", "tangy", "tiny", "velvet", "wobbly", "woolly", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "biscuit", "bramble", "canyon", "cobbler", "comet", "cricket", "dingo",
    "falcon", "ferret", "fiddle", "gadget", "gecko", "gizmo", "goblin", "harbor", "hedgehog",
    "kettle", "lantern", "lemur", "marmot", "meadow", "mitten", "moose", "muffin", "narwhal",
    "nugget", "otter", "pebble", "pickle", "pigeon", "puffin", "quokka", "raccoon", "riddle",
    "rocket", "saddle", "sparrow", "spindle", "sprocket", "squid", "teapot", "thistle", "tundra",
    "turnip", "walrus", "weasel", "whisker", "widget", "wombat", "yak", "zephyr",
];

/// Random letters appended after the word pair.
pub const TAIL_LEN: usize = 12;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Generate a candidate name such as `"fuzzywombatqkzvbnwrtyle"`.
pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
    let mut name = String::with_capacity(adjective.len() + noun.len() + TAIL_LEN);
    name.push_str(adjective);
    name.push_str(noun);
    for _ in 0..TAIL_LEN {
        name.push(char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]));
    }
    name
}

/// log2 of the number of names [`generate`] can produce.
pub fn entropy_bits() -> f64 {
    let words = (ADJECTIVES.len() * NOUNS.len()) as f64;
    words.log2() + TAIL_LEN as f64 * (ALPHABET.len() as f64).log2()
}

/// True if `name` could have been produced by [`generate`] (and is a valid URL token).
pub fn is_valid(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase())
}
