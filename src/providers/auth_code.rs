//! Provider B client (OAuth 2.0 authorization-code grant).
//!
//! Besides the code and refresh exchanges, this client carries the provider's
//! request-signing rules for resource calls: every call needs a synthetic
//! transaction id (`<org_code>U<9 random digits>`) and a local
//! `YYYYMMDDHHmmss` timestamp.

use super::{http_client, send_json, ProviderError};
use crate::config::ProviderBConfig;
use crate::connections::Provider;
use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token endpoint response (code or refresh exchange)
#[derive(Clone, Deserialize)]
pub struct AuthCodeToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
    /// Provider-side user sequence number
    #[serde(default)]
    pub user_seq_no: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for AuthCodeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCodeToken")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Registered account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub fintech_use_num: String,
    pub account_alias: String,
    pub bank_code_std: String,
    pub bank_name: String,
    pub account_num_masked: String,
    pub account_holder_name: String,
    pub account_type: String,
    pub account_state: String,
}

/// `GET /v2.0/account/list` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountListResponse {
    pub api_tran_id: String,
    pub api_tran_dtm: String,
    pub rsp_code: String,
    pub rsp_message: String,
    pub user_name: String,
    pub res_cnt: String,
    pub res_list: Vec<Account>,
}

/// Single transaction line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub tran_date: String,
    pub tran_time: String,
    pub inout_type: String,
    pub tran_type: String,
    pub print_content: String,
    pub tran_amt: String,
    pub after_balance_amt: String,
    pub branch_name: String,
}

/// `GET /v2.0/account/transaction_list/fin_num` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionListResponse {
    pub api_tran_id: String,
    pub api_tran_dtm: String,
    pub rsp_code: String,
    pub rsp_message: String,
    pub bank_tran_id: String,
    pub bank_tran_date: String,
    pub bank_code_tran: String,
    pub bank_rsp_code: String,
    pub bank_rsp_message: String,
    pub fintech_use_num: String,
    pub balance_amt: String,
    pub res_cnt: String,
    pub res_list: Vec<Transaction>,
}

/// Transaction direction filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InquiryType {
    #[default]
    All,
    Deposits,
    Withdrawals,
}

impl InquiryType {
    pub fn as_code(&self) -> &'static str {
        match self {
            InquiryType::All => "A",
            InquiryType::Deposits => "I",
            InquiryType::Withdrawals => "O",
        }
    }
}

/// Formats the current local time as `YYYYMMDDHHmmss`.
pub fn generate_tran_dtime() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Authorization-code client for provider B
pub struct AuthCodeClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    authorize_url: String,
    token_url: String,
    api_base_url: String,
    org_code: String,
    scope: String,
    auth_type: String,
}

impl AuthCodeClient {
    /// Creates a client from config.
    ///
    /// # Returns
    /// * `Err` - If client id, secret or redirect URI is missing
    pub fn new(config: &ProviderBConfig, timeout: Duration) -> Result<Self> {
        if config.client_id.is_empty()
            || config.client_secret.is_empty()
            || config.redirect_uri.is_empty()
        {
            bail!("Provider B OAuth credentials are not configured");
        }

        Ok(Self {
            http: http_client(timeout)?,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            authorize_url: config.authorize_url.clone(),
            token_url: config.token_url.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            org_code: config.org_code.clone(),
            scope: config.scope.clone(),
            auth_type: config.auth_type.clone(),
        })
    }

    /// Builds the user-facing authorization URL embedding `state`.
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&auth_type={}",
            self.authorize_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&self.scope),
            urlencoding::encode(state),
            urlencoding::encode(&self.auth_type),
        )
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<AuthCodeToken, ProviderError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        tracing::debug!(provider = %Provider::ProviderB, "Exchanging authorization code");

        let request = self.http.post(&self.token_url).form(&form);
        let token: AuthCodeToken = send_json(Provider::ProviderB, request).await?;

        tracing::debug!(
            provider = %Provider::ProviderB,
            expires_in = token.expires_in,
            has_refresh_token = token.refresh_token.is_some(),
            "Authorization code exchanged"
        );

        Ok(token)
    }

    /// Exchanges a refresh token for a new access token.
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<AuthCodeToken, ProviderError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        tracing::debug!(provider = %Provider::ProviderB, "Refreshing access token");

        let request = self.http.post(&self.token_url).form(&form);
        send_json(Provider::ProviderB, request).await
    }

    /// Lists the accounts registered by a user.
    pub async fn account_list(
        &self,
        access_token: &str,
        user_seq_no: &str,
    ) -> Result<AccountListResponse, ProviderError> {
        let query = [
            ("user_seq_no", user_seq_no),
            ("include_cancel_yn", "N"),
            ("sort_order", "D"),
        ];

        let request = self
            .http
            .get(format!("{}/v2.0/account/list", self.api_base_url))
            .bearer_auth(access_token)
            .query(&query);

        let response: AccountListResponse = send_json(Provider::ProviderB, request).await?;

        tracing::info!(
            provider = %Provider::ProviderB,
            rsp_code = %response.rsp_code,
            res_cnt = %response.res_cnt,
            "Account list fetched"
        );

        Ok(response)
    }

    /// Lists transactions for one account between two `YYYYMMDD` dates, newest first.
    pub async fn transaction_list(
        &self,
        access_token: &str,
        fintech_use_num: &str,
        from_date: &str,
        to_date: &str,
        inquiry_type: InquiryType,
    ) -> Result<TransactionListResponse, ProviderError> {
        let bank_tran_id = self.bank_tran_id();
        let tran_dtime = generate_tran_dtime();

        let query = [
            ("bank_tran_id", bank_tran_id.as_str()),
            ("fintech_use_num", fintech_use_num),
            ("inquiry_type", inquiry_type.as_code()),
            ("inquiry_base", "D"),
            ("from_date", from_date),
            ("to_date", to_date),
            ("sort_order", "D"),
            ("tran_dtime", tran_dtime.as_str()),
        ];

        let request = self
            .http
            .get(format!(
                "{}/v2.0/account/transaction_list/fin_num",
                self.api_base_url
            ))
            .bearer_auth(access_token)
            .query(&query);

        let response: TransactionListResponse = send_json(Provider::ProviderB, request).await?;

        tracing::info!(
            provider = %Provider::ProviderB,
            bank_tran_id = %bank_tran_id,
            rsp_code = %response.rsp_code,
            res_cnt = %response.res_cnt,
            "Transaction list fetched"
        );

        Ok(response)
    }

    /// Generates a transaction id: org code, `U`, then 9 random digits.
    pub fn bank_tran_id(&self) -> String {
        let random: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
        format!("{}U{:09}", self.org_code, random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn test_config(base: &str) -> ProviderBConfig {
        ProviderBConfig {
            client_id: "client-b".to_string(),
            client_secret: "secret-b".to_string(),
            redirect_uri: "http://localhost:3001/api/v1/oauth/providerB/callback".to_string(),
            authorize_url: format!("{}/oauth/2.0/authorize", base),
            token_url: format!("{}/oauth/2.0/token", base),
            api_base_url: base.to_string(),
            org_code: "1101073389".to_string(),
            scope: "login inquiry".to_string(),
            auth_type: "0".to_string(),
        }
    }

    fn client(base: &str) -> AuthCodeClient {
        AuthCodeClient::new(&test_config(base), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_missing_redirect_uri_rejected() {
        let mut config = test_config("http://localhost");
        config.redirect_uri = String::new();
        assert!(AuthCodeClient::new(&config, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_authorization_url() {
        let client = client("https://bank.example.com");
        let url = client.authorization_url("abc123");

        assert!(url.starts_with("https://bank.example.com/oauth/2.0/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=client-b"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A3001%2Fapi%2Fv1%2Foauth%2FproviderB%2Fcallback"
        ));
        assert!(url.contains("scope=login%20inquiry"));
        assert!(url.contains("state=abc123"));
        assert!(url.contains("auth_type=0"));
    }

    #[test]
    fn test_bank_tran_id_format() {
        let client = client("https://bank.example.com");
        for _ in 0..50 {
            let id = client.bank_tran_id();
            assert_eq!(id.len(), 20);
            assert!(id.starts_with("1101073389U"));
            assert!(id[11..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_tran_dtime_format() {
        let dtime = generate_tran_dtime();
        assert_eq!(dtime.len(), 14);
        assert!(dtime.chars().all(|c| c.is_ascii_digit()));
        assert!(chrono::NaiveDateTime::parse_from_str(&dtime, "%Y%m%d%H%M%S").is_ok());
    }

    #[test]
    fn test_inquiry_type_codes() {
        assert_eq!(InquiryType::default().as_code(), "A");
        assert_eq!(InquiryType::Deposits.as_code(), "I");
        assert_eq!(InquiryType::Withdrawals.as_code(), "O");
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/2.0/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("client_id".into(), "client-b".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret-b".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at","refresh_token":"rt","token_type":"Bearer",
                    "expires_in":7776000,"scope":"login inquiry","user_seq_no":"1100000001"}"#,
            )
            .create_async()
            .await;

        let token = client(&server.url()).exchange_code("auth-code").await.unwrap();

        assert_eq!(token.access_token, "at");
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
        assert_eq!(token.expires_in, 7_776_000);
        assert_eq!(token.user_seq_no.as_deref(), Some("1100000001"));
        assert!(!format!("{:?}", token).contains("\"at\""));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_code_failure_keeps_status_and_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/2.0/token")
            .with_status(400)
            .with_body(r#"{"rsp_code":"O0001","rsp_message":"invalid code"}"#)
            .create_async()
            .await;

        let err = client(&server.url()).exchange_code("bad").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Upstream {
                provider: Provider::ProviderB,
                status: 400,
                body: r#"{"rsp_code":"O0001","rsp_message":"invalid code"}"#.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_access_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/2.0/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at2","refresh_token":"rt2","expires_in":3600}"#)
            .create_async()
            .await;

        let token = client(&server.url()).refresh_access_token("rt").await.unwrap();
        assert_eq!(token.access_token, "at2");
        assert_eq!(token.refresh_token.as_deref(), Some("rt2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_account_list() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2.0/account/list")
            .match_header("authorization", "Bearer at")
            .match_query(Matcher::UrlEncoded("user_seq_no".into(), "1100000001".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"rsp_code":"A0000","res_cnt":"1",
                    "res_list":[{"fintech_use_num":"120220000000000000000001","bank_name":"Test Bank"}]}"#,
            )
            .create_async()
            .await;

        let response = client(&server.url())
            .account_list("at", "1100000001")
            .await
            .unwrap();

        assert_eq!(response.rsp_code, "A0000");
        assert_eq!(response.res_list.len(), 1);
        assert_eq!(response.res_list[0].bank_name, "Test Bank");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transaction_list_sends_signing_fields() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2.0/account/transaction_list/fin_num")
            .match_header("authorization", "Bearer at")
            .match_query(Matcher::AllOf(vec![
                Matcher::Regex("bank_tran_id=1101073389U[0-9]{9}".into()),
                Matcher::Regex("tran_dtime=[0-9]{14}".into()),
                Matcher::UrlEncoded("fintech_use_num".into(), "F1".into()),
                Matcher::UrlEncoded("inquiry_type".into(), "O".into()),
                Matcher::UrlEncoded("inquiry_base".into(), "D".into()),
                Matcher::UrlEncoded("from_date".into(), "20240101".into()),
                Matcher::UrlEncoded("to_date".into(), "20240131".into()),
                Matcher::UrlEncoded("sort_order".into(), "D".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"rsp_code":"A0000","balance_amt":"1000","res_cnt":"1",
                    "res_list":[{"tran_date":"20240105","inout_type":"OUT","tran_amt":"500"}]}"#,
            )
            .create_async()
            .await;

        let response = client(&server.url())
            .transaction_list("at", "F1", "20240101", "20240131", InquiryType::Withdrawals)
            .await
            .unwrap();

        assert_eq!(response.balance_amt, "1000");
        assert_eq!(response.res_list[0].tran_amt, "500");
        mock.assert_async().await;
    }
}
