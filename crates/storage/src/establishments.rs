use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use siret_sync_core::{
    Address, AssociationAttributes, EntrepriseAttributes, Establishment, FiscalYear,
};

use crate::{to_rfc3339, SQLITE_FOREIGN_KEY, SQLITE_UNIQUE};

const SELECT_COLUMNS: &str = "SELECT id, dossier_id, siret, siege_social, naf, libelle_naf, \
     numero_voie, type_voie, nom_voie, complement_adresse, code_postal, localite, code_insee_localite, \
     entreprise_siren, entreprise_capital_social, entreprise_numero_tva_intracommunautaire, \
     entreprise_forme_juridique, entreprise_forme_juridique_code, entreprise_nom_commercial, \
     entreprise_raison_sociale, entreprise_siret_siege_social, entreprise_code_effectif_entreprise, \
     entreprise_date_creation, entreprise_nom, entreprise_prenom, \
     association_rna, association_titre, association_objet, association_date_creation, \
     created_at, updated_at \
     FROM etablissements";

/// Repository for establishments and their fiscal-year children.
#[derive(Clone)]
pub struct EstablishmentRepository {
    pool: SqlitePool,
}

impl EstablishmentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new establishment and returns its identifier.
    pub async fn insert(&self, record: &NewEstablishment<'_>) -> Result<i64, EstablishmentError> {
        if record.siret.trim().is_empty() {
            return Err(EstablishmentError::MissingSiret);
        }

        let created_at = to_rfc3339(record.created_at);
        let result = sqlx::query(
            "INSERT INTO etablissements (dossier_id, siret, created_at, updated_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING id",
        )
        .bind(record.dossier_id)
        .bind(record.siret)
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.get("id")),
            Err(sqlx::Error::Database(db_err)) => {
                let code = db_err.code().map(|code| code.into_owned());
                match code.as_deref() {
                    Some(SQLITE_UNIQUE) => Err(EstablishmentError::DossierTaken),
                    Some(SQLITE_FOREIGN_KEY) => Err(EstablishmentError::MissingDossier),
                    _ => Err(EstablishmentError::Database(sqlx::Error::Database(db_err))),
                }
            }
            Err(err) => Err(EstablishmentError::Database(err)),
        }
    }

    pub async fn fetch(&self, id: i64) -> Result<Option<Establishment>, EstablishmentError> {
        let row = sqlx::query_as::<_, EstablishmentRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(EstablishmentRow::into_domain))
    }

    pub async fn fetch_by_dossier(
        &self,
        dossier_id: i64,
    ) -> Result<Option<Establishment>, EstablishmentError> {
        let row = sqlx::query_as::<_, EstablishmentRow>(&format!(
            "{SELECT_COLUMNS} WHERE dossier_id = ?"
        ))
        .bind(dossier_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EstablishmentRow::into_domain))
    }

    /// Overwrites every `entreprise_*` column with the provided attributes.
    ///
    /// Fiscal years are left untouched.
    pub async fn apply_entreprise(
        &self,
        id: i64,
        attributes: &EntrepriseAttributes,
        updated_at: DateTime<Utc>,
    ) -> Result<(), EstablishmentError> {
        let result = sqlx::query(
            "UPDATE etablissements SET \
             entreprise_siren = ?, \
             entreprise_capital_social = ?, \
             entreprise_numero_tva_intracommunautaire = ?, \
             entreprise_forme_juridique = ?, \
             entreprise_forme_juridique_code = ?, \
             entreprise_nom_commercial = ?, \
             entreprise_raison_sociale = ?, \
             entreprise_siret_siege_social = ?, \
             entreprise_code_effectif_entreprise = ?, \
             entreprise_date_creation = ?, \
             entreprise_nom = ?, \
             entreprise_prenom = ?, \
             updated_at = ? \
             WHERE id = ?",
        )
        .bind(&attributes.siren)
        .bind(attributes.capital_social)
        .bind(&attributes.numero_tva_intracommunautaire)
        .bind(&attributes.forme_juridique)
        .bind(&attributes.forme_juridique_code)
        .bind(&attributes.nom_commercial)
        .bind(&attributes.raison_sociale)
        .bind(&attributes.siret_siege_social)
        .bind(&attributes.code_effectif_entreprise)
        .bind(attributes.date_creation)
        .bind(&attributes.nom)
        .bind(&attributes.prenom)
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EstablishmentError::NotFound);
        }
        Ok(())
    }

    /// Replaces the whole fiscal-year set of an establishment in one transaction.
    pub async fn replace_fiscal_years(
        &self,
        id: i64,
        years: &[FiscalYear],
        updated_at: DateTime<Utc>,
    ) -> Result<(), EstablishmentError> {
        let updated_at = to_rfc3339(updated_at);
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE etablissements SET updated_at = ? WHERE id = ?")
            .bind(&updated_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(EstablishmentError::NotFound);
        }

        sqlx::query("DELETE FROM exercices WHERE etablissement_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for year in years {
            sqlx::query(
                "INSERT INTO exercices (etablissement_id, ca, date_fin_exercice, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(year.ca)
            .bind(year.date_fin_exercice)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Lists fiscal years, most recent closing date first.
    pub async fn fiscal_years(&self, id: i64) -> Result<Vec<FiscalYear>, EstablishmentError> {
        let rows = sqlx::query(
            "SELECT ca, date_fin_exercice FROM exercices \
             WHERE etablissement_id = ? \
             ORDER BY date_fin_exercice DESC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FiscalYear {
                ca: row.get("ca"),
                date_fin_exercice: row.get("date_fin_exercice"),
            })
            .collect())
    }

    /// Deletes the establishment attached to a dossier, with its fiscal years.
    ///
    /// Returns the identifier of the deleted row, if there was one.
    pub async fn delete_for_dossier(
        &self,
        dossier_id: i64,
    ) -> Result<Option<i64>, EstablishmentError> {
        let row = sqlx::query("DELETE FROM etablissements WHERE dossier_id = ? RETURNING id")
            .bind(dossier_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("id")))
    }
}

/// Payload required to create an establishment.
///
/// Only the SIRET is known at capture. Location, NAF and association columns
/// stay empty until a registry sync writes them.
pub struct NewEstablishment<'a> {
    pub dossier_id: Option<i64>,
    pub siret: &'a str,
    pub created_at: DateTime<Utc>,
}

impl<'a> NewEstablishment<'a> {
    /// An establishment known only by its SIRET, as captured from a user.
    pub fn for_siret(dossier_id: Option<i64>, siret: &'a str, created_at: DateTime<Utc>) -> Self {
        Self {
            dossier_id,
            siret,
            created_at,
        }
    }
}

/// Errors that can occur while reading or mutating establishments.
#[derive(Debug, Error)]
pub enum EstablishmentError {
    #[error("establishment not found")]
    NotFound,
    #[error("siret must not be empty")]
    MissingSiret,
    #[error("dossier already has an establishment")]
    DossierTaken,
    #[error("dossier does not exist")]
    MissingDossier,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct EstablishmentRow {
    id: i64,
    dossier_id: Option<i64>,
    siret: String,
    siege_social: Option<bool>,
    naf: Option<String>,
    libelle_naf: Option<String>,
    numero_voie: Option<String>,
    type_voie: Option<String>,
    nom_voie: Option<String>,
    complement_adresse: Option<String>,
    code_postal: Option<String>,
    localite: Option<String>,
    code_insee_localite: Option<String>,
    entreprise_siren: Option<String>,
    entreprise_capital_social: Option<i64>,
    entreprise_numero_tva_intracommunautaire: Option<String>,
    entreprise_forme_juridique: Option<String>,
    entreprise_forme_juridique_code: Option<String>,
    entreprise_nom_commercial: Option<String>,
    entreprise_raison_sociale: Option<String>,
    entreprise_siret_siege_social: Option<String>,
    entreprise_code_effectif_entreprise: Option<String>,
    entreprise_date_creation: Option<NaiveDate>,
    entreprise_nom: Option<String>,
    entreprise_prenom: Option<String>,
    association_rna: Option<String>,
    association_titre: Option<String>,
    association_objet: Option<String>,
    association_date_creation: Option<NaiveDate>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EstablishmentRow {
    fn into_domain(self) -> Establishment {
        Establishment {
            id: self.id,
            dossier_id: self.dossier_id,
            siret: self.siret,
            siege_social: self.siege_social,
            naf: self.naf,
            libelle_naf: self.libelle_naf,
            address: Address {
                numero_voie: self.numero_voie,
                type_voie: self.type_voie,
                nom_voie: self.nom_voie,
                complement_adresse: self.complement_adresse,
                code_postal: self.code_postal,
                localite: self.localite,
                code_insee_localite: self.code_insee_localite,
            },
            entreprise: EntrepriseAttributes {
                siren: self.entreprise_siren,
                capital_social: self.entreprise_capital_social,
                numero_tva_intracommunautaire: self.entreprise_numero_tva_intracommunautaire,
                forme_juridique: self.entreprise_forme_juridique,
                forme_juridique_code: self.entreprise_forme_juridique_code,
                nom_commercial: self.entreprise_nom_commercial,
                raison_sociale: self.entreprise_raison_sociale,
                siret_siege_social: self.entreprise_siret_siege_social,
                code_effectif_entreprise: self.entreprise_code_effectif_entreprise,
                date_creation: self.entreprise_date_creation,
                nom: self.entreprise_nom,
                prenom: self.entreprise_prenom,
            },
            association: AssociationAttributes {
                rna: self.association_rna,
                titre: self.association_titre,
                objet: self.association_objet,
                date_creation: self.association_date_creation,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
