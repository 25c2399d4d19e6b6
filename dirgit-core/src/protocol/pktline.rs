//! Minimal pkt-line framing used by the smart HTTP protocol

use thiserror::Error;

/// The flush packet terminating a pkt-line section
pub const FLUSH: &[u8] = b"0000";

/// Errors reading pkt-line framed data
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PktLineError {
    /// The body ended inside a packet or before the flush packet
    #[error("truncated pkt-line stream")]
    Truncated,

    /// A length prefix was not four hex digits or was too small
    #[error("invalid pkt-line length: {0:?}")]
    InvalidLength(String),

    /// A receive-pack command line did not have `<old> <new> <ref>` form
    #[error("malformed ref update: {0:?}")]
    MalformedCommand(String),
}

/// A single `<old> <new> <ref>` command of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub refname: String,
}

/// Frame `data` as one pkt-line
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:04x}", data.len() + 4).into_bytes();
    out.extend_from_slice(data);
    out
}

/// The `# service=<name>` preamble of a smart info/refs response
pub fn service_advertisement(service: &str) -> Vec<u8> {
    let mut out = encode(format!("# service={}\n", service).as_bytes());
    out.extend_from_slice(FLUSH);
    out
}

/// Split the leading pkt-lines of `body` up to the first flush packet
fn read_section(body: &[u8]) -> Result<Vec<&[u8]>, PktLineError> {
    let mut lines = Vec::new();
    let mut rest = body;

    loop {
        if rest.len() < 4 {
            return Err(PktLineError::Truncated);
        }
        let prefix = std::str::from_utf8(&rest[..4])
            .map_err(|_| PktLineError::InvalidLength(String::from_utf8_lossy(&rest[..4]).into()))?;
        let len = usize::from_str_radix(prefix, 16)
            .map_err(|_| PktLineError::InvalidLength(prefix.to_string()))?;

        if len == 0 {
            return Ok(lines);
        }
        if len < 4 {
            return Err(PktLineError::InvalidLength(prefix.to_string()));
        }
        if rest.len() < len {
            return Err(PktLineError::Truncated);
        }

        lines.push(&rest[4..len]);
        rest = &rest[len..];
    }
}

/// Where a line falls relative to a push certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CertSection {
    Outside,
    Header,
    Commands,
    Signature,
}

/// Parse the ref update commands at the start of a receive-pack request
///
/// Commands carried inside a push certificate are returned like plain ones;
/// the certificate header and signature are skipped. Capabilities after the
/// NUL byte and `shallow` lines are ignored. The pack data after the flush
/// packet is not read.
pub fn parse_ref_updates(body: &[u8]) -> Result<Vec<RefUpdate>, PktLineError> {
    let mut updates = Vec::new();
    let mut cert = CertSection::Outside;

    for line in read_section(body)? {
        let line = String::from_utf8_lossy(line);
        let line = line.split('\0').next().unwrap_or_default().trim_end_matches('\n');

        match cert {
            CertSection::Outside if line == "push-cert" => {
                cert = CertSection::Header;
                continue;
            }
            CertSection::Outside if line.starts_with("shallow ") => continue,
            CertSection::Outside => {}
            CertSection::Header => {
                cert = match line {
                    "" => CertSection::Commands,
                    "push-cert-end" => CertSection::Outside,
                    _ => CertSection::Header,
                };
                continue;
            }
            CertSection::Commands if line == "push-cert-end" => {
                cert = CertSection::Outside;
                continue;
            }
            CertSection::Commands if line.starts_with("-----BEGIN ") => {
                cert = CertSection::Signature;
                continue;
            }
            CertSection::Commands => {}
            CertSection::Signature => {
                if line == "push-cert-end" {
                    cert = CertSection::Outside;
                }
                continue;
            }
        }

        updates.push(parse_command(line)?);
    }

    Ok(updates)
}

/// Parse one `<old> <new> <ref>` command line
fn parse_command(line: &str) -> Result<RefUpdate, PktLineError> {
    let mut fields = line.split(' ');
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(old), Some(new), Some(refname), None) if !refname.is_empty() => Ok(RefUpdate {
            old: old.to_string(),
            new: new.to_string(),
            refname: refname.to_string(),
        }),
        _ => Err(PktLineError::MalformedCommand(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO: &str = "0000000000000000000000000000000000000000";
    const ONE: &str = "1111111111111111111111111111111111111111";

    fn command(old: &str, new: &str, refname: &str, caps: Option<&str>) -> Vec<u8> {
        let mut line = format!("{} {} {}", old, new, refname);
        if let Some(caps) = caps {
            line.push('\0');
            line.push_str(caps);
        }
        line.push('\n');
        encode(line.as_bytes())
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(b"hello\n"), b"000ahello\n".to_vec());
        assert_eq!(encode(b""), b"0004".to_vec());
    }

    #[test]
    fn test_service_advertisement() {
        assert_eq!(
            service_advertisement("git-upload-pack"),
            b"001e# service=git-upload-pack\n0000".to_vec()
        );
    }

    #[test]
    fn test_parse_ref_updates_with_capabilities() {
        let mut body = command(ZERO, ONE, "refs/heads/master", Some("report-status side-band-64k"));
        body.extend(command(ONE, ZERO, "refs/heads/feature", None));
        body.extend_from_slice(FLUSH);
        body.extend_from_slice(b"PACK....");

        let updates = parse_ref_updates(&body).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].refname, "refs/heads/master");
        assert_eq!(updates[0].old, ZERO);
        assert_eq!(updates[0].new, ONE);
        assert_eq!(updates[1].refname, "refs/heads/feature");
    }

    /// A signed push as sent by `git push --signed`
    fn signed_push(refname: &str) -> Vec<u8> {
        let mut body = encode(b"push-cert\0report-status side-band-64k\n");
        body.extend(encode(b"certificate version 0.1\n"));
        body.extend(encode(b"pusher dirgit <dirgit@localhost> 1700000000 +0000\n"));
        body.extend(encode(b"pushee http://127.0.0.1/owner/repo.git\n"));
        body.extend(encode(b"nonce 1700000000-0123456789abcdef\n"));
        body.extend(encode(b"\n"));
        body.extend(command(ZERO, ONE, refname, None));
        body.extend(encode(b"-----BEGIN PGP SIGNATURE-----\n"));
        body.extend(encode(b"\n"));
        body.extend(encode(b"iQEzBAABCAAdFiEEexample\n"));
        body.extend(encode(b"-----END PGP SIGNATURE-----\n"));
        body.extend(encode(b"push-cert-end\n"));
        body.extend_from_slice(FLUSH);
        body.extend_from_slice(b"PACK....");
        body
    }

    #[test]
    fn test_parse_commands_inside_push_cert() {
        let updates = parse_ref_updates(&signed_push("refs/heads/feature")).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].refname, "refs/heads/feature");
        assert_eq!(updates[0].old, ZERO);
        assert_eq!(updates[0].new, ONE);
    }

    #[test]
    fn test_parse_skips_shallow_lines() {
        let mut body = encode(format!("shallow {}\n", ONE).as_bytes());
        body.extend(command(ZERO, ONE, "refs/heads/master", Some("report-status")));
        body.extend_from_slice(FLUSH);

        let updates = parse_ref_updates(&body).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].refname, "refs/heads/master");
    }

    #[test]
    fn test_parse_empty_section() {
        assert!(parse_ref_updates(FLUSH).unwrap().is_empty());
    }

    #[test]
    fn test_parse_truncated() {
        let body = command(ZERO, ONE, "refs/heads/master", None);
        assert_eq!(parse_ref_updates(&body), Err(PktLineError::Truncated));
        assert_eq!(parse_ref_updates(b"00"), Err(PktLineError::Truncated));
    }

    #[test]
    fn test_parse_invalid_length() {
        assert!(matches!(
            parse_ref_updates(b"zzzzdata"),
            Err(PktLineError::InvalidLength(_))
        ));
        assert!(matches!(
            parse_ref_updates(b"0002"),
            Err(PktLineError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_parse_malformed_command() {
        let mut body = encode(b"not a command at all\n");
        body.extend_from_slice(FLUSH);
        assert!(matches!(
            parse_ref_updates(&body),
            Err(PktLineError::MalformedCommand(_))
        ));
    }
}
