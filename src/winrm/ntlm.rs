//! NTLMv2 message construction for WinRM's Negotiate HTTP scheme.
//!
//! Covers the three-leg flow: a type 1 negotiate message, the server's
//! type 2 challenge, and a type 3 authenticate message carrying NTLMv2
//! and LMv2 responses.

use md4::{Digest as _, Md4};

use crate::error::{Error, Result};

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

// NEGOTIATE_UNICODE | NEGOTIATE_OEM | REQUEST_TARGET | NEGOTIATE_NTLM |
// NEGOTIATE_ALWAYS_SIGN | NEGOTIATE_EXTENDED_SESSIONSECURITY
const NEGOTIATE_FLAGS: u32 = 0x0000_0001 | 0x0000_0002 | 0x0000_0004 | 0x0000_0200
    | 0x0000_8000
    | 0x0008_0000;
const AUTHENTICATE_FLAGS: u32 = 0x0000_0001 | 0x0000_0200 | 0x0000_8000 | 0x0008_0000;

#[derive(Debug, Clone)]
pub(crate) struct NtlmAuthenticator {
    username: String,
    password: String,
    domain: String,
    workstation: String,
}

impl NtlmAuthenticator {
    /// `username` may carry the domain as `DOMAIN\user` or `user@domain`.
    pub(crate) fn new(username: &str, password: &str) -> Self {
        let (domain, user) = if let Some((domain, user)) = username.split_once('\\') {
            (domain.to_string(), user.to_string())
        } else if let Some((user, domain)) = username.split_once('@') {
            (domain.to_string(), user.to_string())
        } else {
            (String::new(), username.to_string())
        };
        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "WORKSTATION".into());
        Self {
            username: user,
            password: password.to_string(),
            domain,
            workstation,
        }
    }

    /// Type 1 message.
    pub(crate) fn negotiate_message(&self) -> Vec<u8> {
        let workstation = self.workstation.as_bytes();
        let domain = self.domain.as_bytes();

        let mut msg = SIGNATURE.to_vec();
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        // fixed header is 32 bytes; workstation payload precedes domain
        push_sec_buf(&mut msg, domain.len(), 32 + workstation.len());
        push_sec_buf(&mut msg, workstation.len(), 32);
        msg.extend_from_slice(workstation);
        msg.extend_from_slice(domain);
        msg
    }

    /// Type 3 message answering the server's type 2 challenge.
    pub(crate) fn authenticate_message(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        if challenge.len() < 32 {
            return Err(Error::AuthFailed("invalid NTLM challenge message".into()));
        }
        let server_challenge = &challenge[24..32];
        let client_challenge: [u8; 8] = rand::random();

        let nt_response = self.ntlmv2_response(server_challenge, &client_challenge);
        let lm_response = self.lmv2_response(server_challenge, &client_challenge);

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        // 8 signature + 4 type + 6 security buffers + 4 flags + 8 version
        // + 16 MIC
        let base = 88usize;
        let lm_off = base;
        let nt_off = lm_off + lm_response.len();
        let domain_off = nt_off + nt_response.len();
        let user_off = domain_off + domain.len();
        let workstation_off = user_off + user.len();
        let session_key_off = workstation_off + workstation.len();

        let mut msg = SIGNATURE.to_vec();
        msg.extend_from_slice(&3u32.to_le_bytes());
        push_sec_buf(&mut msg, lm_response.len(), lm_off);
        push_sec_buf(&mut msg, nt_response.len(), nt_off);
        push_sec_buf(&mut msg, domain.len(), domain_off);
        push_sec_buf(&mut msg, user.len(), user_off);
        push_sec_buf(&mut msg, workstation.len(), workstation_off);
        push_sec_buf(&mut msg, 0, session_key_off);
        msg.extend_from_slice(&AUTHENTICATE_FLAGS.to_le_bytes());
        msg.extend_from_slice(&[0u8; 8]); // version
        msg.extend_from_slice(&[0u8; 16]); // MIC

        msg.extend_from_slice(&lm_response);
        msg.extend_from_slice(&nt_response);
        msg.extend_from_slice(&domain);
        msg.extend_from_slice(&user);
        msg.extend_from_slice(&workstation);
        Ok(msg)
    }

    /// NTLMv2 hash: HMAC-MD5(NT hash, UTF16LE(upper(user) + domain)).
    fn ntlmv2_hash(&self) -> [u8; 16] {
        let identity = format!(
            "{}{}",
            self.username.to_uppercase(),
            self.domain.to_uppercase()
        );
        hmac_md5(&self.nt_hash(), &utf16le(&identity))
    }

    fn ntlmv2_response(&self, server_challenge: &[u8], client_challenge: &[u8]) -> Vec<u8> {
        let hash = self.ntlmv2_hash();

        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes()); // blob signature
        blob.extend_from_slice(&0u32.to_le_bytes()); // reserved
        blob.extend_from_slice(&windows_timestamp().to_le_bytes());
        blob.extend_from_slice(client_challenge);
        blob.extend_from_slice(&0u32.to_le_bytes());

        let mut data = server_challenge.to_vec();
        data.extend_from_slice(&blob);
        let proof = hmac_md5(&hash, &data);

        let mut response = proof.to_vec();
        response.extend_from_slice(&blob);
        response
    }

    fn lmv2_response(&self, server_challenge: &[u8], client_challenge: &[u8]) -> Vec<u8> {
        let hash = self.ntlmv2_hash();
        let mut data = server_challenge.to_vec();
        data.extend_from_slice(client_challenge);
        let mut response = hmac_md5(&hash, &data).to_vec();
        response.extend_from_slice(client_challenge);
        response
    }

    /// NT hash: MD4 of the UTF-16LE password.
    fn nt_hash(&self) -> [u8; 16] {
        let mut hasher = Md4::new();
        hasher.update(utf16le(&self.password));
        hasher.finalize().into()
    }
}

fn push_sec_buf(msg: &mut Vec<u8>, len: usize, offset: usize) {
    let len = len as u16;
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 64];
    if key.len() > 64 {
        block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(64 + data.len());
    inner.extend(block.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(data);
    let inner_hash = md5::compute(&inner);

    let mut outer = Vec::with_capacity(64 + 16);
    outer.extend(block.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&inner_hash.0);
    md5::compute(&outer).0
}

/// Seconds since the Windows epoch (1601-01-01) in 100ns ticks.
fn windows_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    const EPOCH_DELTA_SECS: u64 = 11_644_473_600;
    const TICKS_PER_SECOND: u64 = 10_000_000;
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (unix + EPOCH_DELTA_SECS) * TICKS_PER_SECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_md5_matches_rfc2202_vectors() {
        // RFC 2202 test case 2
        let digest = hmac_md5(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            digest,
            [
                0x75, 0x0c, 0x78, 0x3e, 0x6a, 0xb0, 0xb5, 0x03, 0xea, 0xa8, 0x6e, 0x31, 0x0a,
                0x5d, 0xb7, 0x38
            ]
        );
    }

    #[test]
    fn negotiate_message_shape() {
        let auth = NtlmAuthenticator::new("CORP\\administrator", "hunter2");
        let msg = auth.negotiate_message();
        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
        // domain buffer points past the workstation payload
        let domain_len = u16::from_le_bytes(msg[16..18].try_into().unwrap());
        assert_eq!(domain_len as usize, "CORP".len());
        let domain_off = u32::from_le_bytes(msg[20..24].try_into().unwrap()) as usize;
        assert_eq!(&msg[domain_off..domain_off + 4], b"CORP");
    }

    #[test]
    fn authenticate_message_embeds_responses() {
        let auth = NtlmAuthenticator::new("user@corp.example", "secret");
        let mut challenge = vec![0u8; 24];
        challenge.extend_from_slice(&[9u8; 8]); // server challenge
        let msg = auth.authenticate_message(&challenge).unwrap();

        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 3);

        // the user security buffer points at UTF-16LE "user"
        let user_len = u16::from_le_bytes(msg[36..38].try_into().unwrap()) as usize;
        let user_off = u32::from_le_bytes(msg[40..44].try_into().unwrap()) as usize;
        assert_eq!(&msg[user_off..user_off + user_len], utf16le("user"));
    }

    #[test]
    fn short_challenge_is_rejected() {
        let auth = NtlmAuthenticator::new("u", "p");
        assert!(matches!(
            auth.authenticate_message(&[0u8; 8]),
            Err(Error::AuthFailed(_))
        ));
    }

    #[test]
    fn domain_splitting() {
        let a = NtlmAuthenticator::new("CORP\\bob", "x");
        assert_eq!(a.domain, "CORP");
        assert_eq!(a.username, "bob");
        let b = NtlmAuthenticator::new("bob@corp.example", "x");
        assert_eq!(b.domain, "corp.example");
        assert_eq!(b.username, "bob");
        let c = NtlmAuthenticator::new("bob", "x");
        assert!(c.domain.is_empty());
    }
}
