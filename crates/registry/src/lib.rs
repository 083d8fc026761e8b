pub mod entreprise;

pub use entreprise::{
    paris_date, ApiEntrepriseClient, EntrepriseRecord, EntrepriseResponse, ExerciceRecord,
    ExercicesResponse, RegistryError, RegistryRequest, RequestOptions,
};
