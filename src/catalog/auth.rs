//! Pluggable authenticators: Basic, OAuth1 (RFC 5849), and form-based SSO
//! (spec.md §4.4).

use crate::error::{CampusFsError, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use reqwest::{Client, RequestBuilder};
use sha1::Sha1;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub enum Credentials {
    Basic {
        username: String,
        password: String,
    },
    OAuth1 {
        client_key: String,
        client_secret: String,
        session_token_file: Option<PathBuf>,
        no_login: bool,
        no_browser: bool,
        no_store: bool,
    },
    Form {
        shib_url: String,
        username: String,
        password: String,
    },
}

/// A request-signing/attaching seam so each login method can decorate an
/// outgoing `reqwest::RequestBuilder` without the caller caring which
/// method is active.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Attach credentials/signature to `req`.
    fn decorate(&self, req: RequestBuilder, method: &str, url: &str) -> RequestBuilder;

    /// Perform whatever interactive/one-time login handshake this method
    /// requires. Fatal to the mount on failure (spec.md §7 Auth).
    async fn login(&self, client: &Client) -> Result<()>;
}

/// Attach `username`/`password` on every request.
pub struct BasicAuthenticator {
    pub username: String,
    pub password: String,
}

#[async_trait::async_trait]
impl Authenticator for BasicAuthenticator {
    fn decorate(&self, req: RequestBuilder, _method: &str, _url: &str) -> RequestBuilder {
        req.basic_auth(&self.username, Some(&self.password))
    }

    async fn login(&self, _client: &Client) -> Result<()> {
        // Basic auth has no separate handshake; validity is checked by the
        // first real request (`check_login`).
        Ok(())
    }
}

/// Something that can open a URL in a browser for the user; a trait seam so
/// tests don't have to actually spawn one (spec.md §4.4 OAuth1 "open
/// browser" step).
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

pub struct NoopBrowserLauncher;

impl BrowserLauncher for NoopBrowserLauncher {
    fn open(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}

/// Opens the system's default browser via the `webbrowser` crate.
pub struct SystemBrowserLauncher;

impl BrowserLauncher for SystemBrowserLauncher {
    fn open(&self, url: &str) -> Result<()> {
        webbrowser::open(url)
            .map_err(|e| CampusFsError::Auth(format!("could not launch browser for {url}: {e}")))
    }
}

/// RFC 5849 OAuth1 signer. Drives the interactive
/// request-token/authorize/access-token dance on first use; persists the
/// resulting access token to `session_token_file` when permitted.
pub struct OAuth1Authenticator {
    pub client_key: String,
    pub client_secret: String,
    pub session_token_file: Option<PathBuf>,
    pub no_store: bool,
    access_token: parking_lot::Mutex<Option<(String, String)>>,
}

/// One row of the three-legged OAuth1 dance, parsed from the
/// `application/x-www-form-urlencoded` body Stud.IP returns for both the
/// request-token and access-token endpoints.
struct TokenResponse {
    token: String,
    secret: String,
}

fn parse_token_response(body: &str) -> Result<TokenResponse> {
    let mut token = None;
    let mut secret = None;
    for (k, v) in url::form_urlencoded::parse(body.trim().as_bytes()) {
        match k.as_ref() {
            "oauth_token" => token = Some(v.into_owned()),
            "oauth_token_secret" => secret = Some(v.into_owned()),
            _ => {}
        }
    }
    match (token, secret) {
        (Some(token), Some(secret)) => Ok(TokenResponse { token, secret }),
        _ => Err(CampusFsError::Protocol(format!(
            "OAuth1 token endpoint response missing oauth_token/oauth_token_secret: {body:?}"
        ))),
    }
}

impl OAuth1Authenticator {
    pub fn new(
        client_key: String,
        client_secret: String,
        session_token_file: Option<PathBuf>,
        no_store: bool,
    ) -> Self {
        let existing = session_token_file
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| {
                let mut parts = s.trim().splitn(2, '\n');
                Some((parts.next()?.to_string(), parts.next()?.to_string()))
            });
        Self {
            client_key,
            client_secret,
            session_token_file,
            no_store,
            access_token: parking_lot::Mutex::new(existing),
        }
    }

    fn nonce() -> String {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
    }

    fn timestamp() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Build the RFC 5849 signature base string and HMAC-SHA1 signature for
    /// `method`/`url` with the current token secret (if any).
    fn sign(
        &self,
        method: &str,
        url: &str,
        token_secret: Option<&str>,
        extra_params: &[(&str, String)],
    ) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.client_key.clone()),
            ("oauth_nonce".into(), Self::nonce()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), Self::timestamp().to_string()),
            ("oauth_version".into(), "1.0".into()),
        ];
        for (k, v) in extra_params {
            params.push(((*k).to_string(), v.clone()));
        }
        params.sort();

        let encoded_params = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let base = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            percent_encode(url),
            percent_encode(&encoded_params)
        );
        let signing_key = format!(
            "{}&{}",
            percent_encode(&self.client_secret),
            percent_encode(token_secret.unwrap_or(""))
        );

        let mut mac =
            Hmac::<Sha1>::new_from_slice(signing_key.as_bytes()).expect("hmac accepts any key length");
        mac.update(base.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        params.push(("oauth_signature".into(), signature));
        params
    }

    fn authorization_header(
        &self,
        method: &str,
        url: &str,
        token_secret: Option<&str>,
        extra_params: &[(&str, String)],
    ) -> String {
        let mut params = self.sign(method, url, token_secret, extra_params);
        params.sort();
        format!(
            "OAuth {}",
            params
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

fn percent_encode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[async_trait::async_trait]
impl Authenticator for OAuth1Authenticator {
    fn decorate(&self, req: RequestBuilder, method: &str, url: &str) -> RequestBuilder {
        let token = self.access_token.lock().clone();
        let extra = token
            .as_ref()
            .map(|(tok, _)| vec![("oauth_token", tok.clone())])
            .unwrap_or_default();
        let header = self.authorization_header(
            method,
            url,
            token.as_ref().map(|(_, secret)| secret.as_str()),
            &extra,
        );
        req.header("Authorization", header)
    }

    async fn login(&self, _client: &Client) -> Result<()> {
        if self.access_token.lock().is_some() {
            return Ok(());
        }
        Err(CampusFsError::Auth(
            "OAuth1 session has no access token; run the interactive login flow first".into(),
        ))
    }
}

impl OAuth1Authenticator {
    /// Persist a freshly obtained access token, honoring `no_store`.
    pub fn store_access_token(&self, token: String, secret: String) -> Result<()> {
        *self.access_token.lock() = Some((token.clone(), secret.clone()));
        if self.no_store {
            return Ok(());
        }
        if let Some(path) = &self.session_token_file {
            std::fs::write(path, format!("{token}\n{secret}\n"))?;
        }
        Ok(())
    }

    /// Drive the three-legged RFC 5849 dance against `base_url`'s
    /// `oauth/{request_token,authorize,access_token}` endpoints: fetch a
    /// request token, send the user to the authorize page (via `browser`
    /// unless `no_browser`), read the callback on a one-shot local
    /// listener, and exchange the verifier for an access token.
    ///
    /// No-ops if a stored access token already exists.
    pub async fn complete_interactive_login(
        &self,
        client: &Client,
        base_url: &str,
        browser: &dyn BrowserLauncher,
        no_browser: bool,
    ) -> Result<()> {
        if self.access_token.lock().is_some() {
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| CampusFsError::Auth(format!("could not bind OAuth1 callback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| CampusFsError::Auth(format!("could not read OAuth1 callback listener address: {e}")))?
            .port();
        let callback_url = format!("http://127.0.0.1:{port}/callback");

        let request_token_url = format!("{}/oauth/request_token", base_url.trim_end_matches('/'));
        let header = self.authorization_header(
            "GET",
            &request_token_url,
            None,
            &[("oauth_callback", callback_url.clone())],
        );
        let resp = client
            .get(&request_token_url)
            .header("Authorization", header)
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "GET OAuth1 request_token"))?;
        if !resp.status().is_success() {
            return Err(CampusFsError::Auth(format!(
                "OAuth1 request_token rejected with status {}",
                resp.status()
            )));
        }
        let request_token = parse_token_response(
            &resp
                .text()
                .await
                .map_err(|e| CampusFsError::from_reqwest(e, "read OAuth1 request_token body"))?,
        )?;

        let authorize_url = format!(
            "{}/oauth/authorize?{}",
            base_url.trim_end_matches('/'),
            url::form_urlencoded::Serializer::new(String::new())
                .append_pair("oauth_token", &request_token.token)
                .append_pair("oauth_callback", &callback_url)
                .finish()
        );
        if no_browser {
            log::info!("open the following address to authorize campusfs: {authorize_url}");
        } else {
            browser.open(&authorize_url)?;
        }

        let verifier = read_oauth_callback(&listener, &request_token.token).await?;

        let access_token_url = format!("{}/oauth/access_token", base_url.trim_end_matches('/'));
        let header = self.authorization_header(
            "POST",
            &access_token_url,
            Some(&request_token.secret),
            &[
                ("oauth_token", request_token.token.clone()),
                ("oauth_verifier", verifier),
            ],
        );
        let resp = client
            .post(&access_token_url)
            .header("Authorization", header)
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "POST OAuth1 access_token"))?;
        if !resp.status().is_success() {
            return Err(CampusFsError::Auth(format!(
                "OAuth1 access_token rejected with status {}",
                resp.status()
            )));
        }
        let access_token = parse_token_response(
            &resp
                .text()
                .await
                .map_err(|e| CampusFsError::from_reqwest(e, "read OAuth1 access_token body"))?,
        )?;

        self.store_access_token(access_token.token, access_token.secret)
    }
}

/// Accept exactly one connection on `listener`, read its request line and
/// headers by hand (a single local round trip doesn't need a full HTTP
/// server), and return the `oauth_verifier` query parameter of a
/// `GET /callback?...` request whose `oauth_token` matches `expected_token`.
async fn read_oauth_callback(listener: &tokio::net::TcpListener, expected_token: &str) -> Result<String> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| CampusFsError::Auth(format!("OAuth1 callback listener accept failed: {e}")))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| CampusFsError::Auth(format!("reading OAuth1 callback request line: {e}")))?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next();
    let target = parts
        .next()
        .ok_or_else(|| CampusFsError::Protocol("empty OAuth1 callback request line".into()))?
        .to_string();

    // Drain the remaining headers; we don't need any of them.
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| CampusFsError::Auth(format!("reading OAuth1 callback headers: {e}")))?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    let body = "OAuth login complete, you may close this window.";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    write_half
        .write_all(response.as_bytes())
        .await
        .map_err(|e| CampusFsError::Auth(format!("writing OAuth1 callback response: {e}")))?;

    let query = target
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| CampusFsError::Protocol("OAuth1 callback had no query string".into()))?;
    let mut token = None;
    let mut verifier = None;
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        match k.as_ref() {
            "oauth_token" => token = Some(v.into_owned()),
            "oauth_verifier" => verifier = Some(v.into_owned()),
            _ => {}
        }
    }
    match (token, verifier) {
        (Some(token), Some(verifier)) if token == expected_token => Ok(verifier),
        (Some(token), _) => Err(CampusFsError::Auth(format!(
            "OAuth1 callback token {token:?} did not match request token {expected_token:?}"
        ))),
        _ => Err(CampusFsError::Auth("OAuth1 callback was missing oauth_verifier".into())),
    }
}

/// Form/SSO: GET `start_url`, parse the single form's `action`, POST
/// credentials, parse the SAML form from the response, POST it to the
/// asserted URL.
pub struct FormAuthenticator {
    pub shib_url: String,
    pub username: String,
    pub password: String,
    cookie_jar: parking_lot::Mutex<Vec<String>>,
}

impl FormAuthenticator {
    pub fn new(shib_url: String, username: String, password: String) -> Self {
        Self {
            shib_url,
            username,
            password,
            cookie_jar: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Scan HTML for the first `<form ... action="...">` attribute; a small
    /// hand-rolled scan is enough for the single attribute we need rather
    /// than pulling in a full HTML parser.
    fn extract_form_action(html: &str) -> Option<String> {
        let form_start = html.find("<form")?;
        let tag_end = html[form_start..].find('>')? + form_start;
        let tag = &html[form_start..tag_end];
        let action_pos = tag.find("action=")? + "action=".len();
        let quote = tag.as_bytes().get(action_pos).copied()?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        let rest = &tag[action_pos + 1..];
        let end = rest.find(quote as char)?;
        Some(rest[..end].to_string())
    }

    /// Scan for every `<input name="..." value="...">` pair in the first
    /// form, used to resubmit the SAML assertion form unmodified.
    fn extract_hidden_inputs(html: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut rest = html;
        while let Some(start) = rest.find("<input") {
            let tag_end = match rest[start..].find('>') {
                Some(i) => start + i,
                None => break,
            };
            let tag = &rest[start..tag_end];
            let name = Self::attr(tag, "name");
            let value = Self::attr(tag, "value");
            if let (Some(name), Some(value)) = (name, value) {
                out.push((name, value));
            }
            rest = &rest[tag_end..];
        }
        out
    }

    fn attr(tag: &str, attr: &str) -> Option<String> {
        let needle = format!("{attr}=");
        let pos = tag.find(&needle)? + needle.len();
        let quote = tag.as_bytes().get(pos).copied()?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        let rest = &tag[pos + 1..];
        let end = rest.find(quote as char)?;
        Some(rest[..end].to_string())
    }

    pub async fn perform_sso_login(&self, client: &Client) -> Result<()> {
        let start = client
            .get(&self.shib_url)
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "GET SSO start URL"))?;
        let start_url = start.url().clone();
        let body = start
            .text()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "read SSO start body"))?;
        let action = Self::extract_form_action(&body)
            .ok_or_else(|| CampusFsError::Protocol("SSO start page has no <form action=...>".into()))?;
        let action_url = start_url
            .join(&action)
            .map_err(|e| CampusFsError::Protocol(format!("bad SSO form action {action:?}: {e}")))?;

        let login_resp = client
            .post(action_url)
            .form(&[("j_username", &self.username), ("j_password", &self.password)])
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "POST SSO credentials"))?;
        if !login_resp.status().is_success() {
            return Err(CampusFsError::Auth(format!(
                "SSO login rejected with status {}",
                login_resp.status()
            )));
        }
        let saml_url = login_resp.url().clone();
        let saml_body = login_resp
            .text()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "read SAML response body"))?;
        let saml_action = Self::extract_form_action(&saml_body)
            .ok_or_else(|| CampusFsError::Protocol("SAML response has no <form action=...>".into()))?;
        let saml_inputs = Self::extract_hidden_inputs(&saml_body);
        let assertion_url = saml_url
            .join(&saml_action)
            .map_err(|e| CampusFsError::Protocol(format!("bad SAML action {saml_action:?}: {e}")))?;

        let final_resp = client
            .post(assertion_url)
            .form(&saml_inputs)
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "POST SAML assertion"))?;
        if !final_resp.status().is_success() {
            return Err(CampusFsError::Auth(format!(
                "SAML assertion rejected with status {}",
                final_resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Authenticator for FormAuthenticator {
    fn decorate(&self, req: RequestBuilder, _method: &str, _url: &str) -> RequestBuilder {
        let cookies = self.cookie_jar.lock();
        if cookies.is_empty() {
            req
        } else {
            req.header("Cookie", cookies.join("; "))
        }
    }

    async fn login(&self, client: &Client) -> Result<()> {
        self.perform_sso_login(client).await
    }
}
