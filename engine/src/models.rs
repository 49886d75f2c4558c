//! Typed payloads of the domain tables.
//!
//! The engine only interprets `id` and the owning `clinic_id`; every other
//! field is carried through untouched.

use crate::schema::{Entity, Table};
use crate::RecordId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! owned_entity {
    ($(#[$meta:meta])* $name:ident => $table:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(default)]
            pub id: RecordId,
            /// Owning clinic
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub clinic_id: Option<String>,
            #[serde(flatten)]
            pub fields: Map<String, Value>,
        }

        impl $name {
            pub fn new(clinic_id: impl Into<String>) -> Self {
                Self {
                    clinic_id: Some(clinic_id.into()),
                    ..Self::default()
                }
            }

            /// Set a payload field.
            #[must_use]
            pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
                self.fields.insert(field.into(), value.into());
                self
            }
        }

        impl Entity for $name {
            const TABLE: Table = $table;
        }
    };
}

owned_entity!(
    /// A patient of a clinic.
    Patient => Table::Patients
);
owned_entity!(
    /// A scheduled visit.
    Appointment => Table::Appointments
);
owned_entity!(
    /// A treatment given to a patient.
    Treatment => Table::Treatments
);

/// A clinic. Clinics own the records of the other tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Clinic {
    #[serde(default)]
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Clinic {
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

impl Entity for Clinic {
    const TABLE: Table = Table::Clinics;
}
