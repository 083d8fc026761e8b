use metrics::counter;
use thiserror::Error;

use siret_sync_core::{
    normalize_fiscal_years, AttributesError, EntrepriseAttributes, FiscalYear,
};
use siret_sync_registry::{
    ApiEntrepriseClient, EntrepriseRecord, ExerciceRecord, RegistryError, RegistryRequest,
};
use siret_sync_storage::{Database, ProcedureError};

/// Result of a registry lookup that reached the registry.
///
/// The two expected refusals are values, not errors; `Err` is reserved for
/// failures worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    Found(T),
    /// The registry does not know the SIRET.
    NotFound,
    /// The registry rejected the request as malformed.
    BadRequest(String),
}

/// Maps registry responses onto typed establishment attributes, using the
/// credentials of the procedure the lookup is made for.
#[derive(Clone)]
pub struct RegistryAdapter {
    client: ApiEntrepriseClient,
    database: Database,
    default_token: Option<String>,
}

impl RegistryAdapter {
    pub fn new(client: ApiEntrepriseClient, database: Database, default_token: Option<String>) -> Self {
        Self {
            client,
            database,
            default_token,
        }
    }

    /// Identity variant: company fields for the legal entity owning `siret`.
    pub async fn entreprise(
        &self,
        siret: &str,
        procedure_id: i64,
    ) -> Result<Fetched<EntrepriseAttributes>, AdapterError> {
        let token = self.token_for(procedure_id).await?;
        let object = request_object(procedure_id);
        let siren = siret.get(..9).unwrap_or(siret);

        let result = self
            .client
            .fetch_entreprise(
                siren,
                &RegistryRequest {
                    token: &token,
                    object: &object,
                },
            )
            .await;

        match classify("entreprises", result)? {
            Fetched::Found(response) => {
                let attributes = map_entreprise(response.entreprise);
                attributes.validate_for(siret)?;
                Ok(Fetched::Found(attributes))
            }
            Fetched::NotFound => Ok(Fetched::NotFound),
            Fetched::BadRequest(body) => Ok(Fetched::BadRequest(body)),
        }
    }

    /// Fiscal-year variant: the full list of fiscal-year summaries for `siret`.
    pub async fn exercices(
        &self,
        siret: &str,
        procedure_id: i64,
    ) -> Result<Fetched<Vec<FiscalYear>>, AdapterError> {
        let token = self.token_for(procedure_id).await?;
        let object = request_object(procedure_id);

        let result = self
            .client
            .fetch_exercices(
                siret,
                &RegistryRequest {
                    token: &token,
                    object: &object,
                },
            )
            .await;

        match classify("exercices", result)? {
            Fetched::Found(response) => {
                let years = response
                    .exercices
                    .into_iter()
                    .map(map_exercice)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Fetched::Found(normalize_fiscal_years(years)?))
            }
            Fetched::NotFound => Ok(Fetched::NotFound),
            Fetched::BadRequest(body) => Ok(Fetched::BadRequest(body)),
        }
    }

    async fn token_for(&self, procedure_id: i64) -> Result<String, AdapterError> {
        let procedure = self.database.procedures().fetch(procedure_id).await?;
        procedure
            .api_entreprise_token
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.default_token.clone())
            .ok_or(AdapterError::MissingToken { procedure_id })
    }
}

fn request_object(procedure_id: i64) -> String {
    format!("procedure_id: {procedure_id}")
}

fn classify<T>(
    endpoint: &'static str,
    result: Result<T, RegistryError>,
) -> Result<Fetched<T>, AdapterError> {
    let (label, outcome) = match result {
        Ok(value) => ("ok", Ok(Fetched::Found(value))),
        Err(RegistryError::NotFound { .. }) => ("not_found", Ok(Fetched::NotFound)),
        Err(RegistryError::BadRequest { body, .. }) => {
            ("bad_request", Ok(Fetched::BadRequest(body)))
        }
        Err(err) => ("error", Err(AdapterError::Registry(err))),
    };
    counter!("registry_requests_total", "endpoint" => endpoint, "result" => label).increment(1);
    outcome
}

fn map_entreprise(record: EntrepriseRecord) -> EntrepriseAttributes {
    let date_creation = record.creation_date();
    EntrepriseAttributes {
        siren: Some(record.siren),
        capital_social: record.capital_social,
        numero_tva_intracommunautaire: record.numero_tva_intracommunautaire,
        forme_juridique: record.forme_juridique,
        forme_juridique_code: record.forme_juridique_code,
        nom_commercial: record.nom_commercial,
        raison_sociale: record.raison_sociale,
        siret_siege_social: record.siret_siege_social,
        code_effectif_entreprise: record.code_effectif_entreprise,
        date_creation,
        nom: record.nom,
        prenom: record.prenom,
    }
}

fn map_exercice(record: ExerciceRecord) -> Result<FiscalYear, AdapterError> {
    let date_fin_exercice = record
        .closing_date()
        .ok_or(AdapterError::MissingClosingDate)?;
    Ok(FiscalYear {
        ca: record.ca,
        date_fin_exercice,
    })
}

/// Failures of a registry lookup that are worth retrying.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("registry call failed: {0}")]
    Registry(RegistryError),
    #[error("invalid registry payload: {0}")]
    InvalidPayload(#[from] AttributesError),
    #[error("registry returned a fiscal year without closing date")]
    MissingClosingDate,
    #[error("no api entreprise token for procedure {procedure_id}")]
    MissingToken { procedure_id: i64 },
    #[error("failed to load procedure: {0}")]
    Procedure(#[from] ProcedureError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{registry_client, seed_dossier, setup_db};
    use chrono::NaiveDate;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn entreprise_maps_and_uses_procedure_token() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("procedure-token")).await;
        let adapter = RegistryAdapter::new(
            registry_client(&server),
            db.clone(),
            Some("default-token".to_string()),
        );

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/entreprises/418166096")
                    .header("Authorization", "Bearer procedure-token")
                    .query_param("object", format!("procedure_id: {}", dossier.procedure_id));
                then.status(200).json_body(json!({
                    "entreprise": {
                        "siren": "418166096",
                        "capital_social": 459356,
                        "forme_juridique": "SA",
                        "raison_sociale": "OCTO-TECHNOLOGY",
                        "date_creation": 891381600,
                        "unexpected_field": "ignored"
                    }
                }));
            })
            .await;

        let fetched = adapter
            .entreprise("41816609600051", dossier.procedure_id)
            .await
            .expect("fetch");
        mock.assert_async().await;

        let Fetched::Found(attributes) = fetched else {
            panic!("expected attributes, got {fetched:?}");
        };
        assert_eq!(attributes.siren.as_deref(), Some("418166096"));
        assert_eq!(attributes.capital_social, Some(459356));
        assert_eq!(attributes.date_creation, NaiveDate::from_ymd_opt(1998, 4, 1));
    }

    #[tokio::test]
    async fn falls_back_to_default_token() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, None).await;
        let adapter = RegistryAdapter::new(
            registry_client(&server),
            db.clone(),
            Some("default-token".to_string()),
        );

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/exercices/41816609600051")
                    .header("Authorization", "Bearer default-token");
                then.status(200).json_body(json!({ "exercices": [] }));
            })
            .await;

        let fetched = adapter
            .exercices("41816609600051", dossier.procedure_id)
            .await
            .expect("fetch");
        mock.assert_async().await;
        assert_eq!(fetched, Fetched::Found(Vec::new()));

        let without_default = RegistryAdapter::new(registry_client(&server), db, None);
        let err = without_default
            .exercices("41816609600051", dossier.procedure_id)
            .await
            .expect_err("no token");
        assert!(matches!(err, AdapterError::MissingToken { .. }));
    }

    #[tokio::test]
    async fn expected_refusals_are_values() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let adapter = RegistryAdapter::new(registry_client(&server), db, None);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/entreprises/000000000");
                then.status(404).body("{}");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/1234");
                then.status(400).body("bad siret");
            })
            .await;

        assert_eq!(
            adapter
                .entreprise("00000000000000", dossier.procedure_id)
                .await
                .expect("not found is a value"),
            Fetched::NotFound
        );
        assert_eq!(
            adapter
                .exercices("1234", dossier.procedure_id)
                .await
                .expect("bad request is a value"),
            Fetched::BadRequest("bad siret".to_string())
        );
    }

    #[tokio::test]
    async fn foreign_siren_is_rejected_before_merge() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let adapter = RegistryAdapter::new(registry_client(&server), db, None);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/entreprises/418166096");
                then.status(200)
                    .json_body(json!({ "entreprise": { "siren": "999999999" } }));
            })
            .await;

        let err = adapter
            .entreprise("41816609600051", dossier.procedure_id)
            .await
            .expect_err("mismatch");
        assert!(matches!(
            err,
            AdapterError::InvalidPayload(AttributesError::SirenMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn server_errors_stay_errors() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let adapter = RegistryAdapter::new(registry_client(&server), db, None);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/41816609600051");
                then.status(503).body("maintenance");
            })
            .await;

        let err = adapter
            .exercices("41816609600051", dossier.procedure_id)
            .await
            .expect_err("transient");
        assert!(matches!(err, AdapterError::Registry(RegistryError::Status { .. })));
    }
}
