//! `bunker://` connection string formatting — spec.md §6.
//!
//! `bunker://<adminPubkey>?relay=<url>&relay=<url>...`, matching the
//! nsecbunker-style connection URI clients paste in to pair.

use url::Url;

pub fn format_bunker_url(admin_pubkey: &str, relays: &[String]) -> String {
    let mut url = Url::parse(&format!("bunker://{admin_pubkey}"))
        .expect("admin pubkey hex is always a valid host");
    {
        let mut pairs = url.query_pairs_mut();
        for relay in relays {
            pairs.append_pair("relay", relay);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_admin_pubkey_and_relays() {
        let url = format_bunker_url(
            "abc123",
            &["wss://relay.damus.io".to_string(), "wss://nos.lol".to_string()],
        );
        assert!(url.starts_with("bunker://abc123?"));
        assert!(url.contains("relay=wss%3A%2F%2Frelay.damus.io"));
        assert!(url.contains("relay=wss%3A%2F%2Fnos.lol"));
    }
}
