use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Company identity fields returned by the registry, stored with an
/// `entreprise_` prefix on the establishment row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrepriseAttributes {
    pub siren: Option<String>,
    pub capital_social: Option<i64>,
    pub numero_tva_intracommunautaire: Option<String>,
    pub forme_juridique: Option<String>,
    pub forme_juridique_code: Option<String>,
    pub nom_commercial: Option<String>,
    pub raison_sociale: Option<String>,
    pub siret_siege_social: Option<String>,
    pub code_effectif_entreprise: Option<String>,
    pub date_creation: Option<NaiveDate>,
    pub nom: Option<String>,
    pub prenom: Option<String>,
}

impl EntrepriseAttributes {
    /// Checks the attributes are consistent with the SIRET they were fetched for.
    pub fn validate_for(&self, siret: &str) -> Result<(), AttributesError> {
        if let Some(siren) = self.siren.as_deref() {
            let expected = siret.get(..9).unwrap_or(siret);
            if siren != expected {
                return Err(AttributesError::SirenMismatch {
                    expected: expected.to_string(),
                    actual: siren.to_string(),
                });
            }
        }
        if let Some(capital) = self.capital_social {
            if capital < 0 {
                return Err(AttributesError::NegativeAmount {
                    field: "capital_social",
                    value: capital,
                });
            }
        }
        Ok(())
    }
}

/// Association registry fields, present only for associations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationAttributes {
    pub rna: Option<String>,
    pub titre: Option<String>,
    pub objet: Option<String>,
    pub date_creation: Option<NaiveDate>,
}

/// Postal address parts of an establishment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub numero_voie: Option<String>,
    pub type_voie: Option<String>,
    pub nom_voie: Option<String>,
    pub complement_adresse: Option<String>,
    pub code_postal: Option<String>,
    pub localite: Option<String>,
    pub code_insee_localite: Option<String>,
}

/// One annual financial summary (exercice).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalYear {
    /// Turnover (chiffre d'affaires) in euros.
    pub ca: i64,
    pub date_fin_exercice: NaiveDate,
}

impl FiscalYear {
    pub fn year(&self) -> i32 {
        self.date_fin_exercice.year()
    }
}

/// Validates a fiscal-year set before it replaces the stored one.
///
/// Entries sharing a closing date collapse to the last one received; the
/// result is ordered by closing date, most recent first.
pub fn normalize_fiscal_years(
    years: Vec<FiscalYear>,
) -> Result<Vec<FiscalYear>, AttributesError> {
    let mut normalized: Vec<FiscalYear> = Vec::with_capacity(years.len());
    for year in years {
        if year.ca < 0 {
            return Err(AttributesError::NegativeAmount {
                field: "ca",
                value: year.ca,
            });
        }
        normalized.retain(|existing| existing.date_fin_exercice != year.date_fin_exercice);
        normalized.push(year);
    }
    normalized.sort_by(|a, b| b.date_fin_exercice.cmp(&a.date_fin_exercice));
    Ok(normalized)
}

/// Registry payload rejected before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributesError {
    #[error("registry returned siren {actual}, expected {expected}")]
    SirenMismatch { expected: String, actual: String },
    #[error("{field} must not be negative (got {value})")]
    NegativeAmount { field: &'static str, value: i64 },
}

/// Legal establishment attached to a dossier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Establishment {
    pub id: i64,
    pub dossier_id: Option<i64>,
    pub siret: String,
    pub siege_social: Option<bool>,
    pub naf: Option<String>,
    pub libelle_naf: Option<String>,
    pub address: Address,
    pub entreprise: EntrepriseAttributes,
    pub association: AssociationAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Establishment {
    pub fn siren(&self) -> Option<&str> {
        self.entreprise.siren.as_deref()
    }

    pub fn is_association(&self) -> bool {
        self.association
            .rna
            .as_deref()
            .is_some_and(|rna| !rna.trim().is_empty())
    }

    /// Address as a single space separated line, for geocoding.
    pub fn geo_adresse(&self) -> String {
        let a = &self.address;
        [
            &a.numero_voie,
            &a.type_voie,
            &a.nom_voie,
            &a.complement_adresse,
            &a.code_postal,
            &a.localite,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Human readable address: street, complement, then postcode and town.
    pub fn inline_adresse(&self) -> String {
        let a = &self.address;
        let street = join_present(&[&a.numero_voie, &a.type_voie, &a.nom_voie]);
        let complement = join_present(&[&a.complement_adresse]);
        let town = join_present(&[&a.code_postal, &a.localite]);

        [street, complement, town]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Values indexed by dossier search.
    pub fn search_terms(&self) -> Vec<&str> {
        let e = &self.entreprise;
        let a = &self.address;
        let candidates: [Option<&str>; 19] = [
            e.siren.as_deref(),
            e.numero_tva_intracommunautaire.as_deref(),
            e.forme_juridique.as_deref(),
            e.forme_juridique_code.as_deref(),
            e.nom_commercial.as_deref(),
            e.raison_sociale.as_deref(),
            e.siret_siege_social.as_deref(),
            e.nom.as_deref(),
            e.prenom.as_deref(),
            self.association.rna.as_deref(),
            self.association.titre.as_deref(),
            self.association.objet.as_deref(),
            Some(self.siret.as_str()),
            self.naf.as_deref(),
            self.libelle_naf.as_deref(),
            a.nom_voie.as_deref(),
            a.code_postal.as_deref(),
            a.localite.as_deref(),
            a.code_insee_localite.as_deref(),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter(|value| !value.trim().is_empty())
            .collect()
    }

    /// Read-only company projection for display.
    pub fn entreprise(&self) -> Entreprise {
        let e = &self.entreprise;
        Entreprise {
            siren: e.siren.clone(),
            capital_social: e.capital_social,
            numero_tva_intracommunautaire: e.numero_tva_intracommunautaire.clone(),
            forme_juridique: e.forme_juridique.clone(),
            forme_juridique_code: e.forme_juridique_code.clone(),
            nom_commercial: e.nom_commercial.clone(),
            raison_sociale: e.raison_sociale.clone(),
            siret_siege_social: e.siret_siege_social.clone(),
            code_effectif_entreprise: e.code_effectif_entreprise.clone(),
            date_creation: e.date_creation,
            nom: e.nom.clone(),
            prenom: e.prenom.clone(),
            inline_adresse: self.inline_adresse(),
        }
    }
}

/// Company view-model built from an [`Establishment`]; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entreprise {
    pub siren: Option<String>,
    pub capital_social: Option<i64>,
    pub numero_tva_intracommunautaire: Option<String>,
    pub forme_juridique: Option<String>,
    pub forme_juridique_code: Option<String>,
    pub nom_commercial: Option<String>,
    pub raison_sociale: Option<String>,
    pub siret_siege_social: Option<String>,
    pub code_effectif_entreprise: Option<String>,
    pub date_creation: Option<NaiveDate>,
    pub nom: Option<String>,
    pub prenom: Option<String>,
    pub inline_adresse: String,
}

impl Entreprise {
    /// Legal name, or the owner's name for sole traders.
    pub fn raison_sociale_or_name(&self) -> String {
        match self.raison_sociale.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => join_present(&[&self.nom, &self.prenom]),
        }
    }
}

fn join_present(parts: &[&Option<String>]) -> String {
    parts
        .iter()
        .filter_map(|part| part.as_deref())
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
