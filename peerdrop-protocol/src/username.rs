//! Random display names

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &["Swift", "Bright", "Quick", "Smart", "Cool", "Fast"];
const NOUNS: &[&str] = &["Peer", "Node", "Link", "User", "Friend", "Star"];

/// A name such as `SwiftPeer42`: adjective, noun and a number below 1000
pub fn generate_username() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Swift");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Peer");
    format!("{}{}{}", adjective, noun, rng.gen_range(0..1000))
}
