//! Checking the persistence directory listing
//!
//! `ls -1` output is parsed into exact entry names. A required `bin` is not
//! satisfied by an entry called `binaries`.

use std::collections::BTreeSet;

use crate::Error;

/// Command listing one entry per line
pub fn list_command(path: &str) -> String {
    format!(
        "ls -1 {}",
        shell_escape::unix::escape(std::borrow::Cow::Borrowed(path))
    )
}

/// Entry names in `ls -1` output
pub fn parse_listing(listing: &str) -> BTreeSet<&str> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Fail with the missing entries unless every required entry is listed
pub fn check_artifacts(listing: &str, required: &[String]) -> Result<Vec<String>, Error> {
    let entries = parse_listing(listing);
    let missing: Vec<String> = required
        .iter()
        .filter(|r| !entries.contains(r.as_str()))
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(Error::Verification {
            missing,
            listing: listing.to_string(),
        });
    }
    Ok(entries.into_iter().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<String> {
        ["bin", "pki", "manifests", "konnectivity.conf"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn all_entries_present() {
        let listing = "bin\nimages\nkonnectivity.conf\nmanifests\npki\n";
        let entries = check_artifacts(listing, &required()).unwrap();
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn reports_every_missing_entry() {
        let err = check_artifacts("bin\npki\n", &required()).unwrap_err();
        match err {
            Error::Verification { missing, listing } => {
                assert_eq!(missing, vec!["manifests", "konnectivity.conf"]);
                assert_eq!(listing, "bin\npki\n");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn substrings_do_not_count() {
        let listing = "binaries\npki.bak\nmanifests\nkonnectivity.conf\n";
        let err = check_artifacts(listing, &required()).unwrap_err();
        assert!(err.to_string().contains("bin"));
    }

    #[test]
    fn listing_command_quotes_path() {
        assert_eq!(list_command("/tmp/kmc-test"), "ls -1 /tmp/kmc-test");
        assert_eq!(list_command("/tmp/kmc test"), "ls -1 '/tmp/kmc test'");
    }
}
