//! Token authentication for the HTTP API.
//!
//! Users are configured at startup as `name:token` pairs. A request carries its
//! token either as `Authorization: Bearer <token>` or in a `token` cookie.
use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use serde::Serialize;

use crate::error::{ScanError, ScanResult};

pub const TOKEN_COOKIE: &str = "token";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserStore {
    by_token: HashMap<String, String>,
}

impl UserStore {
    /// Build from `name:token` specs.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> ScanResult<Self> {
        let mut store = Self::default();
        for spec in specs {
            let spec = spec.as_ref();
            let (name, token) = spec
                .split_once(':')
                .map(|(n, t)| (n.trim(), t.trim()))
                .filter(|(n, t)| !n.is_empty() && !t.is_empty())
                .ok_or_else(|| ScanError::InvalidConfig(format!("user spec must be name:token, got {spec:?}")))?;
            if let Some(existing) = store.insert(name, token) {
                return Err(ScanError::InvalidConfig(format!(
                    "user {name} reuses the token of user {existing}"
                )));
            }
        }
        Ok(store)
    }

    /// Store with a single user holding a freshly generated token.
    pub fn generated(username: &str) -> (Self, String) {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut store = Self::default();
        store.insert(username, &token);
        (store, token)
    }

    /// Returns the user previously holding `token`, if any.
    pub fn insert(&mut self, username: &str, token: &str) -> Option<String> {
        self.by_token.insert(token.to_string(), username.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn lookup(&self, token: &str) -> Option<CurrentUser> {
        self.by_token.get(token).map(|name| CurrentUser {
            username: name.clone(),
        })
    }

    /// Resolve the caller from request headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> ScanResult<CurrentUser> {
        request_token(headers)
            .and_then(|t| self.lookup(&t))
            .ok_or(ScanError::Unauthenticated)
    }
}

/// Token from the bearer header, falling back to the cookie.
pub fn request_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(t) = bearer {
        return Some(t.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == TOKEN_COOKIE)
        .map(|(_, v)| v.to_string())
        .filter(|t| !t.is_empty())
}

pub fn session_cookie(token: &str) -> String {
    format!("{TOKEN_COOKIE}={token}; HttpOnly; Path=/; SameSite=Strict")
}

pub fn cleared_cookie() -> String {
    format!("{TOKEN_COOKIE}=; HttpOnly; Path=/; Max-Age=0")
}
