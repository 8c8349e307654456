//! Authenticated sessions against the elective host
//!
//! A `Session` owns one cookie jar, one pinned User-Agent and one
//! generation stamp. It is usable only while logged in, unexpired and of
//! the pool's current generation; the pool layer enforces the last part.
//!
//! Every call runs the response through the classifier chain, so the
//! caller always receives either clean data or a typed `ElectiveError`.

use std::time::{Duration, Instant};

use rand::Rng as _;
use reqwest::header;

use crate::error::{ElectOutcome, ElectiveError};
use crate::net::{self, Endpoints};
use crate::rate_limit::RateLimiter;
use std::sync::Arc;

/// Which pool a session calls home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Elective,
    Probe,
}

/// The SSO endpoint rejects cookie-less requests with a bare 101 page; a
/// dummy JSESSIONID in the site's own format gets us past it.
#[must_use]
pub fn dummy_jsessionid() -> String {
    const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    let head: String = (0..52)
        .map(|_| ALNUM[rng.random_range(0..ALNUM.len())] as char)
        .collect();
    let tail: String = (0..13).map(|_| rng.random_range(0..10).to_string()).collect();
    format!("{head}!{tail}")
}

pub struct Session {
    pub id: usize,
    pub generation: u64,
    pub kind: PoolKind,
    user_agent: String,
    http: reqwest::Client,
    endpoints: Endpoints,
    rate: Arc<RateLimiter>,
    timeout: Duration,
    logged_in: bool,
    /// None means no expiry (`max_life = -1`).
    expires_at: Option<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("kind", &self.kind)
            .field("logged_in", &self.logged_in)
            .finish_non_exhaustive()
    }
}

fn build_http(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, ElectiveError> {
    reqwest::Client::builder()
        .cookie_store(true)
        .user_agent(user_agent.to_string())
        .timeout(timeout)
        .build()
        .map_err(|e| ElectiveError::OperationFailed {
            message: format!("http client build failed: {e}"),
        })
}

impl Session {
    pub fn new(
        id: usize,
        generation: u64,
        kind: PoolKind,
        user_agent: &str,
        endpoints: Endpoints,
        rate: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Result<Self, ElectiveError> {
        Ok(Self {
            id,
            generation,
            kind,
            user_agent: user_agent.to_string(),
            http: build_http(user_agent, timeout)?,
            endpoints,
            rate,
            timeout,
            logged_in: false,
            expires_at: None,
        })
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }

    /// Fresh cookie jar + new UA; the session must re-authenticate after.
    pub fn rearm(&mut self, user_agent: &str) -> Result<(), ElectiveError> {
        self.user_agent = user_agent.to_string();
        self.http = build_http(user_agent, self.timeout)?;
        self.logged_in = false;
        self.expires_at = None;
        Ok(())
    }

    /// Arm the session after a successful SSO login. `max_life = -1` means
    /// no expiry.
    pub fn arm(&mut self, max_life: i64) {
        self.logged_in = true;
        self.expires_at = if max_life < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(max_life.unsigned_abs()))
        };
    }

    pub fn mark_logged_out(&mut self) {
        self.logged_in = false;
    }

    async fn get_html(&self, url: &str, referer: &str) -> Result<String, ElectiveError> {
        self.rate.throttle(url).await;
        let resp = self
            .http
            .get(url)
            .header(header::REFERER, referer)
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        net::check_status(status)?;
        net::check_html_state(&body)?;
        Ok(body)
    }

    /// SSO login with the IAAA token. Returns the landing page body so the
    /// dual-degree step can extract its `sida` from it.
    pub async fn sso_login(&mut self, token: &str) -> Result<String, ElectiveError> {
        let url = format!("{}?token={token}", self.endpoints.sso_login());
        self.rate.throttle(&url).await;
        let resp = self
            .http
            .get(&url)
            .header(header::COOKIE, format!("JSESSIONID={}", dummy_jsessionid()))
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        net::check_status(status)?;
        net::check_html_state(&body)?;
        Ok(body)
    }

    /// Second SSO hop for dual-degree accounts.
    pub async fn sso_login_dual_degree(
        &mut self,
        sida: &str,
        sttp: &str,
        referer: &str,
    ) -> Result<String, ElectiveError> {
        let url = self.endpoints.sso_login_dual_degree(sida, sttp);
        self.get_html(&url, referer).await
    }

    /// Best-effort logout; errors are the caller's to swallow.
    pub async fn logout(&mut self) -> Result<(), ElectiveError> {
        let url = self.endpoints.logout();
        let referer = self.endpoints.listing_referer();
        let _ = self.get_html(&url, &referer).await?;
        self.logged_in = false;
        Ok(())
    }

    /// Fetch the help page (election calendar).
    pub async fn get_help_controller(&self) -> Result<String, ElectiveError> {
        let url = self.endpoints.help_controller();
        let referer = self.endpoints.elect_supplement("/");
        self.get_html(&url, &referer).await
    }

    /// Listing page 1.
    pub async fn get_supply_cancel(&self, student_id: &str) -> Result<String, ElectiveError> {
        let url = self.endpoints.supply_cancel(student_id);
        let referer = self.endpoints.listing_referer();
        self.get_html(&url, &referer).await
    }

    /// Listing page `page` (dual-degree accounts live on page 2).
    pub async fn get_supplement(
        &self,
        student_id: &str,
        page: u32,
    ) -> Result<String, ElectiveError> {
        let url = self.endpoints.supplement(student_id, page);
        let referer = self.endpoints.listing_referer();
        self.get_html(&url, &referer).await
    }

    /// Fetch a captcha image.
    pub async fn get_draw_servlet(&self, student_id: &str) -> Result<Vec<u8>, ElectiveError> {
        let url = self.endpoints.draw_servlet();
        self.rate.throttle(&url).await;
        let resp = self
            .http
            .get(&url)
            .header(header::REFERER, self.endpoints.action_referer(student_id))
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        net::check_status(status)?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        Ok(bytes.to_vec())
    }

    /// Submit a candidate code; returns the raw `valid` field.
    pub async fn get_validate(
        &self,
        student_id: &str,
        code: &str,
    ) -> Result<String, ElectiveError> {
        let url = self.endpoints.validate();
        self.rate.throttle(&url).await;
        let resp = self
            .http
            .post(&url)
            .header(header::REFERER, self.endpoints.action_referer(student_id))
            .form(&[("xh", student_id), ("validCode", code)])
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        net::check_status(status)?;
        net::parse_validate(&body)
    }

    /// Submit the election and classify the tip page.
    pub async fn elect_supplement(
        &self,
        student_id: &str,
        href: &str,
    ) -> Result<ElectOutcome, ElectiveError> {
        let url = self.endpoints.elect_supplement(href);
        self.rate.throttle(&url).await;
        let resp = self
            .http
            .get(&url)
            .header(header::REFERER, self.endpoints.action_referer(student_id))
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        net::check_status(status)?;
        net::classify_elect(&body)
    }
}

/// One-shot IAAA client. Not reusable across logins on purpose: each
/// authentication starts from a clean jar and a fresh UA.
pub struct IaaaClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    rate: Arc<RateLimiter>,
}

impl IaaaClient {
    pub fn new(
        user_agent: &str,
        endpoints: Endpoints,
        rate: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Result<Self, ElectiveError> {
        Ok(Self {
            http: build_http(user_agent, timeout)?,
            endpoints,
            rate,
        })
    }

    /// Fetch the OAuth home page to collect cookies. Doubles as the
    /// OFFLINE health probe.
    pub async fn oauth_home(&self) -> Result<(), ElectiveError> {
        let url = self.endpoints.oauth_home();
        self.rate.throttle(&url).await;
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        net::check_status(resp.status().as_u16())
    }

    /// Authenticate and return the short-lived SSO token.
    pub async fn oauth_login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<String, ElectiveError> {
        let url = self.endpoints.oauth_login();
        self.rate.throttle(&url).await;
        let resp = self
            .http
            .post(&url)
            .header(header::REFERER, self.endpoints.oauth_home())
            .form(&[("userName", username), ("password", password)])
            .send()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ElectiveError::from_reqwest(&e))?;
        net::check_status(status)?;
        net::classify_iaaa_login(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_jsessionid_shape() {
        for _ in 0..10 {
            let id = dummy_jsessionid();
            let (head, tail) = id.split_once('!').unwrap();
            assert_eq!(head.len(), 52);
            assert!(head.chars().all(|c| c.is_ascii_alphanumeric()));
            assert_eq!(tail.len(), 13);
            assert!(tail.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_session_expiry_arming() {
        let endpoints = Endpoints::new(&crate::config::NetConfig::default());
        let rate = Arc::new(RateLimiter::disabled());
        let mut s = Session::new(
            1,
            0,
            PoolKind::Elective,
            "test-agent",
            endpoints,
            rate,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!s.is_logged_in());
        s.arm(-1);
        assert!(s.is_logged_in());
        assert!(!s.is_expired());
        s.arm(0);
        assert!(s.is_expired());
        s.rearm("other-agent").unwrap();
        assert!(!s.is_logged_in());
        assert_eq!(s.user_agent(), "other-agent");
    }
}
