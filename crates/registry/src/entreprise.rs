use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Europe::Paris;
use reqwest::{Client, Response, StatusCode};
use serde::{de, de::DeserializeOwned, Deserialize, Deserializer};
use thiserror::Error;
use url::Url;

/// Client for the API Entreprise endpoints used to enrich establishments.
#[derive(Clone)]
pub struct ApiEntrepriseClient {
    http: Client,
    base_url: Url,
    options: RequestOptions,
}

/// Values sent with every request to identify the caller.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub context: String,
    pub recipient: Option<String>,
}

/// Scope of a single registry call.
pub struct RegistryRequest<'a> {
    pub token: &'a str,
    /// Free-text reason for the call, usually the procedure it serves.
    pub object: &'a str,
}

impl ApiEntrepriseClient {
    /// Creates a new client. `base_url` must end with a slash.
    pub fn new(base_url: Url, http: Client, options: RequestOptions) -> Self {
        Self {
            http,
            base_url,
            options,
        }
    }

    /// Fetches the legal entity owning the establishment.
    pub async fn fetch_entreprise(
        &self,
        siren: &str,
        request: &RegistryRequest<'_>,
    ) -> Result<EntrepriseResponse, RegistryError> {
        let url = self.base_url.join(&format!("entreprises/{siren}"))?;
        let response = self.get(url, request).await?;
        parse_json(response).await
    }

    /// Fetches the fiscal-year summaries of an establishment.
    pub async fn fetch_exercices(
        &self,
        siret: &str,
        request: &RegistryRequest<'_>,
    ) -> Result<ExercicesResponse, RegistryError> {
        let url = self.base_url.join(&format!("exercices/{siret}"))?;
        let response = self.get(url, request).await?;
        parse_json(response).await
    }

    async fn get(
        &self,
        mut url: Url,
        request: &RegistryRequest<'_>,
    ) -> Result<Response, RegistryError> {
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("context", &self.options.context);
            if let Some(recipient) = self.options.recipient.as_deref() {
                query.append_pair("recipient", recipient);
            }
            query.append_pair("object", request.object);
            query.append_pair("non_diffusables", "true");
        }

        Ok(self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", request.token))
            .send()
            .await?)
    }
}

/// Body of `GET /entreprises/{siren}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntrepriseResponse {
    pub entreprise: EntrepriseRecord,
}

/// Legal entity as returned by the registry. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntrepriseRecord {
    pub siren: String,
    #[serde(default, deserialize_with = "opt_amount")]
    pub capital_social: Option<i64>,
    pub numero_tva_intracommunautaire: Option<String>,
    pub forme_juridique: Option<String>,
    pub forme_juridique_code: Option<String>,
    pub nom_commercial: Option<String>,
    pub raison_sociale: Option<String>,
    pub siret_siege_social: Option<String>,
    pub code_effectif_entreprise: Option<String>,
    /// Unix timestamp of the creation date, midnight Paris time.
    pub date_creation: Option<i64>,
    pub nom: Option<String>,
    pub prenom: Option<String>,
}

impl EntrepriseRecord {
    pub fn creation_date(&self) -> Option<NaiveDate> {
        self.date_creation.and_then(paris_date)
    }
}

/// Body of `GET /exercices/{siret}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExercicesResponse {
    #[serde(default)]
    pub exercices: Vec<ExerciceRecord>,
}

/// One fiscal-year summary.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExerciceRecord {
    #[serde(deserialize_with = "amount")]
    pub ca: i64,
    pub date_fin_exercice: Option<String>,
    pub date_fin_exercice_timestamp: Option<i64>,
}

impl ExerciceRecord {
    /// Closing date of the fiscal year, from the RFC 3339 field or the timestamp.
    pub fn closing_date(&self) -> Option<NaiveDate> {
        self.date_fin_exercice
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.date_naive())
            .or_else(|| self.date_fin_exercice_timestamp.and_then(paris_date))
    }
}

/// Converts a registry timestamp to the calendar date it denotes in Paris.
pub fn paris_date(timestamp: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|value| value.with_timezone(&Paris).date_naive())
}

/// Errors produced by the API Entreprise client.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resource not found: {body}")]
    NotFound { body: String },
    #[error("bad request ({status}): {body}")]
    BadRequest { status: StatusCode, body: String },
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl RegistryError {
    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::NOT_FOUND => Self::NotFound { body },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::BadRequest { status, body }
            }
            _ => Self::Status { status, body },
        }
    }

    /// HTTP status returned by the registry, when one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            Self::BadRequest { status, .. } | Self::Status { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            Self::Url(_) => None,
        }
    }
}

async fn parse_json<T>(response: Response) -> Result<T, RegistryError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(RegistryError::from_status(status, body));
    }

    Ok(response.json().await?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawAmount {
    fn into_amount<E: de::Error>(self) -> Result<Option<i64>, E> {
        match self {
            Self::Integer(value) => Ok(Some(value)),
            Self::Float(value) if value.is_finite() => Ok(Some(value.trunc() as i64)),
            Self::Float(value) => Err(E::custom(format!("invalid amount {value}"))),
            Self::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                text.parse::<i64>()
                    .or_else(|_| text.parse::<f64>().map(|value| value.trunc() as i64))
                    .map(Some)
                    .map_err(|_| E::custom(format!("invalid amount {text:?}")))
            }
        }
    }
}

fn opt_amount<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawAmount>::deserialize(deserializer)? {
        Some(raw) => raw.into_amount(),
        None => Ok(None),
    }
}

fn amount<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    opt_amount(deserializer)?.ok_or_else(|| <D::Error as de::Error>::custom("missing amount"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> ApiEntrepriseClient {
        ApiEntrepriseClient::new(
            base_url.clone(),
            Client::builder().build().expect("client"),
            RequestOptions {
                context: "demarches-simplifiees.fr".to_string(),
                recipient: Some("13002526500013".to_string()),
            },
        )
    }

    fn request() -> RegistryRequest<'static> {
        RegistryRequest {
            token: "token",
            object: "procedure_id: 12",
        }
    }

    #[tokio::test]
    async fn fetch_entreprise_parses_response() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/entreprises/418166096")
                    .query_param("context", "demarches-simplifiees.fr")
                    .query_param("recipient", "13002526500013")
                    .query_param("object", "procedure_id: 12")
                    .query_param("non_diffusables", "true")
                    .header("Authorization", "Bearer token");
                then.status(200).json_body(json!({
                    "entreprise": {
                        "siren": "418166096",
                        "capital_social": "459356",
                        "numero_tva_intracommunautaire": "FR16418166096",
                        "forme_juridique": "SA à directoire (s.a.i.)",
                        "forme_juridique_code": "5699",
                        "nom_commercial": "OCTO-TECHNOLOGY",
                        "procedure_collective": false,
                        "raison_sociale": "OCTO-TECHNOLOGY",
                        "siret_siege_social": "41816609600051",
                        "code_effectif_entreprise": "22",
                        "date_creation": 891381600,
                        "nom": null,
                        "prenom": null
                    },
                    "etablissement_siege": { "siret": "41816609600051" }
                }));
            })
            .await;

        let response = client
            .fetch_entreprise("418166096", &request())
            .await
            .expect("fetch entreprise");
        mock.assert_async().await;

        let entreprise = response.entreprise;
        assert_eq!(entreprise.capital_social, Some(459356));
        assert_eq!(entreprise.raison_sociale.as_deref(), Some("OCTO-TECHNOLOGY"));
        assert_eq!(
            entreprise.creation_date(),
            NaiveDate::from_ymd_opt(1998, 4, 1)
        );
    }

    #[tokio::test]
    async fn fetch_exercices_reads_both_date_forms() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/41816609600051");
                then.status(200).json_body(json!({
                    "exercices": [
                        {
                            "ca": "21009417",
                            "date_fin_exercice": "2013-12-31T00:00:00+01:00",
                            "date_fin_exercice_timestamp": 1388444400
                        },
                        {
                            "ca": 18968298,
                            "date_fin_exercice_timestamp": 1356908400
                        }
                    ]
                }));
            })
            .await;

        let response = client
            .fetch_exercices("41816609600051", &request())
            .await
            .expect("fetch exercices");

        assert_eq!(response.exercices.len(), 2);
        assert_eq!(response.exercices[0].ca, 21009417);
        assert_eq!(
            response.exercices[0].closing_date(),
            NaiveDate::from_ymd_opt(2013, 12, 31)
        );
        assert_eq!(
            response.exercices[1].closing_date(),
            NaiveDate::from_ymd_opt(2012, 12, 31)
        );
    }

    #[tokio::test]
    async fn not_found_and_bad_request_are_distinct() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/entreprises/000000000");
                then.status(404).body("not found");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/123");
                then.status(422).body("siret invalide");
            })
            .await;

        let err = client
            .fetch_entreprise("000000000", &request())
            .await
            .expect_err("should be missing");
        assert!(matches!(err, RegistryError::NotFound { ref body } if body == "not found"));

        let err = client
            .fetch_exercices("123", &request())
            .await
            .expect_err("should be rejected");
        match err {
            RegistryError::BadRequest { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "siret invalide");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_statuses_are_reported_verbatim() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/entreprises/418166096");
                then.status(502).body("upstream down");
            })
            .await;

        let err = client
            .fetch_entreprise("418166096", &request())
            .await
            .expect_err("should error");
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert!(matches!(err, RegistryError::Status { .. }));
    }

    #[tokio::test]
    async fn malformed_amount_is_a_decode_error() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/41816609600051");
                then.status(200).json_body(json!({
                    "exercices": [{ "ca": "beaucoup", "date_fin_exercice": "2013-12-31T00:00:00+01:00" }]
                }));
            })
            .await;

        let err = client
            .fetch_exercices("41816609600051", &request())
            .await
            .expect_err("should fail to decode");
        assert!(matches!(err, RegistryError::Http(_)));
    }
}
