//! ASCII armor handling. XMPP carries only the armored body; the
//! `-----BEGIN PGP ...-----` header and footer are added and removed here.

/// Body of an armored block: everything between the header's blank line and
/// the footer.
pub fn strip(data: &str) -> String {
    data.lines()
        .skip_while(|line| !line.is_empty())
        .skip_while(|line| line.is_empty())
        .take_while(|line| !line.starts_with('-'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap a body received over XMPP so gpg accepts it. `kind` is `MESSAGE`
/// or `SIGNATURE`.
pub fn wrap(data: &str, kind: &str) -> String {
    format!("-----BEGIN PGP {kind}-----\nVersion: PGP\n\n{data}\n-----END PGP {kind}-----\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNATURE: &str = "-----BEGIN PGP SIGNATURE-----\n\
        Version: GnuPG v2\n\
        Comment: test\n\
        \n\
        iQEzBAABCAAdFiEE\n\
        =abcd\n\
        -----END PGP SIGNATURE-----\n";

    #[test]
    fn strip_keeps_only_the_body() {
        assert_eq!(strip(SIGNATURE), "iQEzBAABCAAdFiEE\n=abcd");
    }

    #[test]
    fn strip_handles_crlf() {
        let crlf = SIGNATURE.replace('\n', "\r\n");
        assert_eq!(strip(&crlf), "iQEzBAABCAAdFiEE\n=abcd");
    }

    #[test]
    fn strip_of_garbage_is_empty() {
        assert_eq!(strip("not armored at all"), "");
        assert_eq!(strip(""), "");
    }

    #[test]
    fn wrapped_body_strips_back() {
        let wrapped = wrap("hQEMA5", "MESSAGE");
        assert!(wrapped.starts_with("-----BEGIN PGP MESSAGE-----\nVersion: PGP\n\n"));
        assert!(wrapped.ends_with("-----END PGP MESSAGE-----\n"));
        assert_eq!(strip(&wrapped), "hQEMA5");
    }
}
