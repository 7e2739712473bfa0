pub mod commit;
pub mod config;
pub mod containers;
pub mod copy;
pub mod from;
pub mod images;
pub mod mount;
pub mod pull;
pub mod push;
pub mod rm;
pub mod run;

/// Split `KEY=VALUE`; a missing `=` gives an empty value.
pub(crate) fn split_pair(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("A=b=c"), ("A", "b=c"));
        assert_eq!(split_pair("FLAG"), ("FLAG", ""));
    }
}
