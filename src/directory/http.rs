//! HTTP fleet directory client.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` to keep the
//! async runtime unblocked. Login tokens are valid for roughly five
//! minutes; the client re-logs-in once a token passes the refresh age.
//! 5xx answers are retried with backoff before surfacing; 4xx surface
//! immediately. Bodies that arrive but fail to decode surface as
//! [`DirectoryError::Decode`], never as a transport failure, so a schema
//! drift on the directory side is tellable apart in the logs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::policies::BackoffPolicy;

use super::{FleetDirectory, Vehicle};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct LoginReply {
    token: String,
}

/// Failure of one blocking exchange, before classification.
enum ExchangeError {
    /// The HTTP round trip failed (connect, status, body read).
    Http(ureq::Error),
    /// The body arrived but did not match the expected schema.
    Decode(serde_json::Error),
}

impl ExchangeError {
    fn classify(self) -> DirectoryError {
        match self {
            ExchangeError::Http(err) => DirectoryError::Fetch {
                reason: err.to_string(),
            },
            ExchangeError::Decode(err) => DirectoryError::Decode {
                reason: err.to_string(),
            },
        }
    }
}

impl From<ureq::Error> for ExchangeError {
    fn from(err: ureq::Error) -> Self {
        ExchangeError::Http(err)
    }
}

struct TokenState {
    token: String,
    minted_at: Instant,
}

/// `ureq`-backed [`FleetDirectory`].
pub struct HttpDirectory {
    cfg: DirectoryConfig,
    tank_id: u32,
    backoff: BackoffPolicy,
    token: Mutex<Option<TokenState>>,
    vehicles: RwLock<HashMap<String, Vehicle>>,
}

impl HttpDirectory {
    pub fn new(cfg: DirectoryConfig, tank_id: u32) -> Self {
        Self {
            cfg,
            tank_id,
            backoff: BackoffPolicy::default(),
            token: Mutex::new(None),
            vehicles: RwLock::new(HashMap::new()),
        }
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }

    /// 5xx answers are the retryable class; everything else is final.
    fn is_retryable(err: &ureq::Error) -> bool {
        matches!(err, ureq::Error::StatusCode(code) if *code >= 500)
    }

    /// Reads a response body and decodes it, keeping transport and schema
    /// failures separable.
    fn read_json_body<T: serde::de::DeserializeOwned>(
        response: ureq::http::Response<ureq::Body>,
    ) -> Result<T, ExchangeError> {
        let text = response
            .into_body()
            .read_to_string()
            .map_err(ExchangeError::Http)?;
        serde_json::from_str(&text).map_err(ExchangeError::Decode)
    }

    /// Runs a blocking HTTP exchange with bounded 5xx retries. Decode
    /// failures are never retried; the body arrived, the schema is wrong.
    async fn exchange<T, F>(&self, call: F) -> Result<T, DirectoryError>
    where
        T: Send + 'static,
        F: Fn(&ureq::Agent) -> Result<T, ExchangeError> + Send + Sync + 'static,
    {
        let backoff = self.backoff;
        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut prev_delay: Option<Duration> = None;
            let mut attempt = 0;
            loop {
                attempt += 1;
                match call(&agent) {
                    Ok(v) => return Ok(v),
                    Err(ExchangeError::Http(err))
                        if Self::is_retryable(&err) && attempt < MAX_ATTEMPTS =>
                    {
                        let delay = backoff.next(prev_delay);
                        prev_delay = Some(delay);
                        log::warn!("directory 5xx (attempt {attempt}/{MAX_ATTEMPTS}): {err}");
                        std::thread::sleep(delay);
                    }
                    Err(err) => return Err(err.classify()),
                }
            }
        })
        .await
        .map_err(|e| DirectoryError::Fetch {
            reason: format!("task join error: {e}"),
        })?
    }

    /// Returns a token no older than the refresh age, logging in if needed.
    async fn token(&self) -> Result<String, DirectoryError> {
        if let Some(state) = self.token.lock().unwrap().as_ref() {
            if state.minted_at.elapsed() < self.cfg.token_refresh() {
                return Ok(state.token.clone());
            }
        }

        let url = Self::endpoint(&self.cfg.base_url, "login");
        let username = self.cfg.username.clone();
        let password = self.cfg.password.clone();
        let reply: LoginReply = self
            .exchange(move |agent| {
                let response = agent.post(&url).send_json(serde_json::json!({
                    "username": username,
                    "password": password,
                }))?;
                Self::read_json_body(response)
            })
            .await?;

        if reply.token.is_empty() {
            return Err(DirectoryError::Auth {
                reason: "directory returned an empty token".to_string(),
            });
        }
        *self.token.lock().unwrap() = Some(TokenState {
            token: reply.token.clone(),
            minted_at: Instant::now(),
        });
        Ok(reply.token)
    }
}

#[async_trait]
impl FleetDirectory for HttpDirectory {
    async fn refresh_tags(&self) -> Result<usize, DirectoryError> {
        let token = self.token().await?;
        let url = Self::endpoint(
            &self.cfg.base_url,
            &format!("GetAvailableTagsByTankId/{}", self.tank_id),
        );
        let listed: Vec<Vehicle> = self
            .exchange(move |agent| {
                let response = agent
                    .get(&url)
                    .header("Authorization", &format!("Bearer {token}"))
                    .call()?;
                Self::read_json_body(response)
            })
            .await?;

        let count = listed.len();
        let mut vehicles = self.vehicles.write().await;
        vehicles.clear();
        for v in listed {
            vehicles.insert(v.tag.clone(), v);
        }
        log::info!("directory listed {count} permitted vehicles for tank {}", self.tank_id);
        Ok(count)
    }

    async fn validate_tag(&self, tag: &str) -> Option<Vehicle> {
        self.vehicles.read().await.get(tag).cloned()
    }

    async fn update_vehicle_hours(&self, tag: &str, hours: u32) -> Result<(), DirectoryError> {
        let token = self.token().await?;
        let url = Self::endpoint(&self.cfg.base_url, "UpdateVehicleHours");
        let tag = tag.to_string();
        self.exchange(move |agent| {
            agent
                .post(&url)
                .header("Authorization", &format!("Bearer {token}"))
                .send_json(serde_json::json!({
                    "tag": tag,
                    "machine_hours": hours,
                }))
                .map(|_| ())
                .map_err(ExchangeError::Http)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_without_duplicate_slashes() {
        assert_eq!(
            HttpDirectory::endpoint("http://fleet:9080/", "login"),
            "http://fleet:9080/login"
        );
        assert_eq!(
            HttpDirectory::endpoint("http://fleet:9080", "GetAvailableTagsByTankId/7"),
            "http://fleet:9080/GetAvailableTagsByTankId/7"
        );
    }

    #[test]
    fn only_5xx_is_retryable() {
        assert!(HttpDirectory::is_retryable(&ureq::Error::StatusCode(503)));
        assert!(!HttpDirectory::is_retryable(&ureq::Error::StatusCode(401)));
    }

    #[test]
    fn decode_failures_classify_apart_from_transport() {
        let decode = ExchangeError::Decode(serde_json::from_str::<LoginReply>("{}").unwrap_err());
        assert!(matches!(decode.classify(), DirectoryError::Decode { .. }));

        let http = ExchangeError::Http(ureq::Error::StatusCode(503));
        assert!(matches!(http.classify(), DirectoryError::Fetch { .. }));
    }

    #[tokio::test]
    async fn validate_tag_is_exact_and_case_sensitive() {
        let dir = HttpDirectory::new(DirectoryConfig::default(), 1);
        dir.vehicles.write().await.insert(
            "E200001D8914005717701BFC".to_string(),
            Vehicle {
                tag: "E200001D8914005717701BFC".to_string(),
                fleet_number: "LDR-42".to_string(),
                tank_capacity_liters: "100".parse().unwrap(),
                current_machine_hours: 200,
            },
        );
        assert!(dir.validate_tag("E200001D8914005717701BFC").await.is_some());
        assert!(dir.validate_tag("e200001d8914005717701bfc").await.is_none());
        assert!(dir.validate_tag("AAAAAAAAAAAAAAAAAAAAAAAA").await.is_none());
    }
}
