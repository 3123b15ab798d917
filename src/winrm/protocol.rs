//! Minimal WS-Man shell client: enough of the protocol to run commands in
//! a `cmd` shell, feed stdin, stream output and tear the shell down.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, trace};
use uuid::Uuid;

use super::ntlm::NtlmAuthenticator;
use crate::error::{Error, Result};

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

const MAX_ENVELOPE_SIZE: u32 = 153_600;
const OPERATION_TIMEOUT: &str = "PT60S";

/// How requests are authenticated.
pub(crate) enum AuthMode {
    Basic,
    Ntlm(NtlmAuthenticator),
    /// Client certificate presented at the TLS layer.
    Certificate,
}

/// One WS-Man endpoint plus credentials.
pub(crate) struct WsmanClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    auth: AuthMode,
}

/// One round of `Receive` output.
#[derive(Debug, Default)]
pub(crate) struct ReceiveChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub done: bool,
}

impl WsmanClient {
    pub(crate) fn new(
        http: reqwest::Client,
        url: String,
        user: String,
        password: String,
        auth: AuthMode,
    ) -> Self {
        Self {
            http,
            url,
            user,
            password,
            auth,
        }
    }

    pub(crate) async fn create_shell(&self) -> Result<String> {
        let body = self.envelope(
            ACTION_CREATE,
            None,
            r#"<w:OptionSet><w:Option Name="WINRS_NOPROFILE">FALSE</w:Option><w:Option Name="WINRS_CODEPAGE">65001</w:Option></w:OptionSet>"#,
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
        );
        let response = self.post(body).await?;
        let shell_id = tag_text(&response, "ShellId")
            .ok_or_else(|| Error::CommandFailed("no shell id in create response".into()))?;
        debug!("created winrm shell {shell_id}");
        Ok(shell_id)
    }

    pub(crate) async fn command(&self, shell_id: &str, cmd: &str) -> Result<String> {
        let body = self.envelope(
            ACTION_COMMAND,
            Some(shell_id),
            "",
            &format!(
                "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
                xml_escape(cmd)
            ),
        );
        let response = self.post(body).await?;
        let command_id = tag_text(&response, "CommandId")
            .ok_or_else(|| Error::CommandFailed("no command id in command response".into()))?;
        trace!("started winrm command {command_id}");
        Ok(command_id)
    }

    /// Feed stdin bytes; `end` closes the stream.
    pub(crate) async fn send_stdin(
        &self,
        shell_id: &str,
        command_id: &str,
        data: &[u8],
        end: bool,
    ) -> Result<()> {
        let body = self.envelope(
            ACTION_SEND,
            Some(shell_id),
            "",
            &format!(
                r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{command_id}" End="{end}">{}</rsp:Stream></rsp:Send>"#,
                BASE64.encode(data)
            ),
        );
        self.post(body).await.map(drop)
    }

    pub(crate) async fn receive(&self, shell_id: &str, command_id: &str) -> Result<ReceiveChunk> {
        let body = self.envelope(
            ACTION_RECEIVE,
            Some(shell_id),
            "",
            &format!(
                r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
            ),
        );
        let response = self.post(body).await?;
        Ok(ReceiveChunk {
            stdout: collect_stream(&response, "stdout"),
            stderr: collect_stream(&response, "stderr"),
            exit_code: tag_text(&response, "ExitCode").and_then(|c| c.parse().ok()),
            done: response.contains("CommandState/Done") || response.contains(r#"State="Done""#),
        })
    }

    pub(crate) async fn signal_terminate(&self, shell_id: &str, command_id: &str) -> Result<()> {
        let body = self.envelope(
            ACTION_SIGNAL,
            Some(shell_id),
            "",
            &format!(
                "<rsp:Signal CommandId=\"{command_id}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"
            ),
        );
        self.post(body).await.map(drop)
    }

    pub(crate) async fn delete_shell(&self, shell_id: &str) -> Result<()> {
        let body = self.envelope(ACTION_DELETE, Some(shell_id), "", "");
        self.post(body).await.map(drop)?;
        debug!("deleted winrm shell {shell_id}");
        Ok(())
    }

    fn envelope(
        &self,
        action: &str,
        shell_id: Option<&str>,
        options: &str,
        body: &str,
    ) -> String {
        let selector = shell_id
            .map(|id| {
                format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{id}</w:Selector></w:SelectorSet>"#)
            })
            .unwrap_or_default();
        let message_id = Uuid::new_v4();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <s:Header>
    <a:To>{url}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo><a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    {options}{selector}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            url = self.url,
        )
    }

    async fn post(&self, body: String) -> Result<String> {
        let response = match &self.auth {
            AuthMode::Basic => self
                .request(&body)
                .basic_auth(&self.user, Some(&self.password))
                .send()
                .await,
            AuthMode::Certificate => self.request(&body).send().await,
            AuthMode::Ntlm(auth) => return self.post_ntlm(auth, body).await,
        }
        .map_err(|err| Error::CommandFailed(format!("winrm request: {err}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| Error::CommandFailed(format!("winrm response: {err}")))?;
        if !status.is_success() {
            return Err(Error::CommandFailed(format!(
                "winrm request failed: {status}: {}",
                fault_text(&text).unwrap_or_else(|| text.chars().take(200).collect())
            )));
        }
        Ok(text)
    }

    /// Three-leg NTLM: negotiate, receive the challenge, answer it with the
    /// actual request attached.
    async fn post_ntlm(&self, auth: &NtlmAuthenticator, body: String) -> Result<String> {
        let negotiate = BASE64.encode(auth.negotiate_message());
        let response = self
            .http
            .post(&self.url)
            .header("Authorization", format!("Negotiate {negotiate}"))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .send()
            .await
            .map_err(|err| Error::CommandFailed(format!("ntlm negotiate: {err}")))?;

        if response.status().as_u16() != 401 {
            return Err(Error::AuthFailed(format!(
                "expected an NTLM challenge, got {}",
                response.status()
            )));
        }
        let challenge_b64 = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Negotiate "))
            .ok_or_else(|| Error::AuthFailed("no NTLM challenge in response".into()))?
            .to_string();
        let challenge = BASE64
            .decode(challenge_b64.trim())
            .map_err(|err| Error::AuthFailed(format!("invalid NTLM challenge encoding: {err}")))?;

        let authenticate = BASE64.encode(auth.authenticate_message(&challenge)?);
        let response = self
            .http
            .post(&self.url)
            .header("Authorization", format!("Negotiate {authenticate}"))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(body)
            .send()
            .await
            .map_err(|err| Error::CommandFailed(format!("ntlm authenticate: {err}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| Error::CommandFailed(format!("winrm response: {err}")))?;
        if !status.is_success() {
            return Err(Error::CommandFailed(format!(
                "winrm request failed: {status}: {}",
                fault_text(&text).unwrap_or_else(|| text.chars().take(200).collect())
            )));
        }
        Ok(text)
    }

    fn request(&self, body: &str) -> reqwest::RequestBuilder {
        self.http
            .post(&self.url)
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(body.to_string())
    }
}

/// Text of the first `<prefix:TAG ...>text</prefix:TAG>` element, falling
/// back to the `Name="TAG">text<` selector form.
fn tag_text(response: &str, tag: &str) -> Option<String> {
    let needle = format!(":{tag}");
    let mut pos = 0;
    while let Some(found) = response[pos..].find(&needle) {
        let at = pos + found;
        pos = at + needle.len();
        let Some(lt) = response[..at].rfind('<') else {
            continue;
        };
        if response.as_bytes().get(lt + 1) == Some(&b'/') {
            continue; // closing tag
        }
        let rest = &response[at + needle.len()..];
        let content_start = match rest.bytes().next() {
            Some(b'>') => at + needle.len() + 1,
            Some(b' ') => {
                let Some(gt) = rest.find('>') else { continue };
                if rest[..gt].ends_with('/') {
                    continue; // self-closing
                }
                at + needle.len() + gt + 1
            }
            _ => continue,
        };
        let len = response[content_start..].find('<')?;
        return Some(response[content_start..content_start + len].to_string());
    }

    // selector form: <w:Selector Name="ShellId">...</w:Selector>
    let open = format!("{tag}\">");
    let start = response.find(&open)? + open.len();
    let len = response[start..].find('<')?;
    Some(response[start..start + len].to_string())
}

/// Concatenated, base64-decoded payload of every stream element named
/// `name`, in document order.
fn collect_stream(response: &str, name: &str) -> Vec<u8> {
    let marker = format!("Name=\"{name}\"");
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(found) = response[pos..].find("<rsp:Stream ") {
        let tag_start = pos + found;
        let Some(tag_len) = response[tag_start..].find('>') else {
            break;
        };
        let tag_end = tag_start + tag_len;
        let tag = &response[tag_start..tag_end];
        if !tag.contains(&marker) || tag.ends_with('/') {
            pos = tag_end + 1;
            continue;
        }
        let content_start = tag_end + 1;
        let Some(close) = response[content_start..].find("</rsp:Stream>") else {
            break;
        };
        let content = response[content_start..content_start + close].trim();
        if !content.is_empty() {
            if let Ok(decoded) = BASE64.decode(content) {
                out.extend_from_slice(&decoded);
            }
        }
        pos = content_start + close;
    }
    out
}

fn fault_text(response: &str) -> Option<String> {
    tag_text(response, "Text").map(|t| t.trim().to_string())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_id_is_recovered_from_create_response() {
        let response = r#"<s:Body><rsp:Shell><rsp:ShellId>4711-AFFE</rsp:ShellId></rsp:Shell></s:Body>"#;
        assert_eq!(tag_text(response, "ShellId").as_deref(), Some("4711-AFFE"));

        let selector = r#"<w:SelectorSet><w:Selector Name="ShellId">BEEF</w:Selector></w:SelectorSet>"#;
        assert_eq!(tag_text(selector, "ShellId").as_deref(), Some("BEEF"));
    }

    #[test]
    fn streams_are_decoded_and_concatenated_in_order() {
        let response = format!(
            r#"<rsp:ReceiveResponse>
                <rsp:Stream Name="stdout" CommandId="1">{}</rsp:Stream>
                <rsp:Stream Name="stderr" CommandId="1">{}</rsp:Stream>
                <rsp:Stream Name="stdout" CommandId="1">{}</rsp:Stream>
                <rsp:Stream Name="stdout" CommandId="1" End="true"/>
                <rsp:CommandState CommandId="1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"/>
                <rsp:ExitCode>42</rsp:ExitCode>
            </rsp:ReceiveResponse>"#,
            BASE64.encode("hello "),
            BASE64.encode("warn"),
            BASE64.encode("world"),
        );
        assert_eq!(collect_stream(&response, "stdout"), b"hello world");
        assert_eq!(collect_stream(&response, "stderr"), b"warn");
        assert_eq!(
            tag_text(&response, "ExitCode").and_then(|c| c.parse::<i32>().ok()),
            Some(42)
        );
        assert!(response.contains("CommandState/Done"));
    }

    #[test]
    fn command_is_xml_escaped() {
        assert_eq!(
            xml_escape(r#"echo "a<b" & dir"#),
            "echo &quot;a&lt;b&quot; &amp; dir"
        );
    }

    #[test]
    fn fault_text_is_extracted() {
        let response = r#"<s:Fault><s:Reason><s:Text xml:lang="en-US">access denied</s:Text></s:Reason></s:Fault>"#;
        assert_eq!(fault_text(response).as_deref(), Some("access denied"));
    }
}
