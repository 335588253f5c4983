//! Dataset Model: typed, indexed pharmacy records.
//!
//! Built once from raw rows and immutable afterwards. Engines share it behind
//! an `Arc` and swap whole models on reload.

#[cfg(test)]
pub(crate) mod fixtures;
mod loader;
pub mod sample;

pub use loader::{field, rows_from_json, RawRow, ALIAS_SEPARATOR};

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{
    normalize_name, CopayRule, CoverageRecord, CoverageStatus, DrugEntry, DrugId, InsurerId, MedicationRecord,
    RecordId,
};

/// Load failures. Every variant is fatal to the load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("row {row}: missing required field `{field}`")]
    MissingField { row: usize, field: &'static str },

    #[error("row {row}: invalid value {value:?} for `{field}`")]
    InvalidValue {
        row: usize,
        field: &'static str,
        value: String,
    },

    #[error("row {row}: neither a price observation nor a coverage rule")]
    UnclassifiedRow { row: usize },

    #[error("alias `{alias}` belongs to both `{first}` and `{second}`")]
    AliasConflict {
        alias: String,
        first: DrugId,
        second: DrugId,
    },

    #[error("conflicting unit costs for `{drug}` on {date}")]
    ConflictingObservation { drug: DrugId, date: NaiveDate },

    #[error("row {row}: coverage for `{drug}`, which has no price observations")]
    UnknownCoverageDrug { row: usize, drug: DrugId },

    #[error("row {row}: generic equivalent `{generic}` of `{drug}` is not a known drug")]
    UnknownGeneric { row: usize, drug: DrugId, generic: String },

    #[error("`{drug}` names both `{first}` and `{second}` as its generic equivalent")]
    GenericConflict {
        drug: DrugId,
        first: DrugId,
        second: DrugId,
    },

    #[error("rows are not a JSON array of objects: {0}")]
    InvalidJson(String),
}

/// The error `load` reports for malformed input.
pub type SchemaError = DatasetError;

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Outcome of looking a drug up by any of its names.
#[derive(Debug, Clone, PartialEq)]
pub enum DrugLookup<'a> {
    Found {
        drug: DrugId,
        /// Observations ordered by date
        records: &'a [MedicationRecord],
    },
    /// The name matches no drug or alias
    Unknown { name: String },
}

/// Headline figures for a loaded dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSummary {
    pub drug_count: usize,
    pub insurers: Vec<String>,
    pub medication_records: usize,
    pub coverage_records: usize,
    pub missing_costs: usize,
    /// Mean of each drug's latest known unit cost
    pub mean_latest_unit_cost: Option<f64>,
    /// Brand drugs with a generic equivalent
    pub drugs_with_generic: usize,
    pub by_insurer: Vec<InsurerSummary>,
}

/// Coverage breakdown for one insurer, counted over every coverage record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsurerSummary {
    pub insurer: String,
    pub coverage_records: usize,
    pub covered: usize,
    pub prior_authorization: usize,
    pub step_therapy: usize,
    pub not_covered: usize,
    /// Lowest and highest copay floors and caps named by the insurer's rules
    pub min_copay: Option<f64>,
    pub max_copay: Option<f64>,
    /// Mean percentage over coinsurance rules
    pub mean_coinsurance_pct: Option<f64>,
}

/// Immutable pharmacy dataset.
#[derive(Debug, Clone)]
pub struct DatasetModel {
    drugs: BTreeMap<DrugId, DrugEntry>,
    /// Normalized name or alias → drug
    names: BTreeMap<String, DrugId>,
    medications: BTreeMap<DrugId, Vec<MedicationRecord>>,
    coverage: BTreeMap<(InsurerId, DrugId), Vec<CoverageRecord>>,
    insurers: BTreeMap<InsurerId, String>,
    fingerprint: String,
}

type ObservationKey = (DrugId, Option<String>, Option<String>, NaiveDate);

impl DatasetModel {
    /// Build a model from raw rows.
    pub fn load(rows: &[RawRow]) -> DatasetResult<Self> {
        let mut drugs: BTreeMap<DrugId, DrugEntry> = BTreeMap::new();
        let mut names: BTreeMap<String, DrugId> = BTreeMap::new();
        let mut observations: BTreeMap<ObservationKey, (Option<String>, Option<f64>)> = BTreeMap::new();
        let mut pending_coverage = Vec::new();
        let mut pending_generics = Vec::new();
        let mut insurers: BTreeMap<InsurerId, String> = BTreeMap::new();

        for (index, raw) in rows.iter().enumerate() {
            let row_number = index + 1;
            let parsed = loader::parse_row(row_number, raw)?;
            let drug = DrugId::new(&parsed.drug_name);

            let entry = drugs.entry(drug.clone()).or_insert_with(|| DrugEntry {
                id: drug.clone(),
                display_name: parsed.drug_name.clone(),
                aliases: Vec::new(),
                generic: None,
            });
            register_name(&mut names, &parsed.drug_name, &drug)?;
            for alias in &parsed.aliases {
                register_name(&mut names, alias, &drug)?;
                let key = normalize_name(alias);
                if key != drug.as_str() && !entry.aliases.iter().any(|a| normalize_name(a) == key) {
                    entry.aliases.push(alias.clone());
                }
            }

            if let Some(generic) = parsed.generic {
                pending_generics.push((row_number, drug.clone(), generic));
            }

            if let Some(obs) = parsed.observation {
                let key = (drug.clone(), obs.form, obs.strength.as_deref().map(normalize_name), obs.observed_on);
                match observations.get(&key) {
                    Some((_, existing)) if *existing != obs.unit_cost => {
                        return Err(DatasetError::ConflictingObservation {
                            drug,
                            date: obs.observed_on,
                        });
                    }
                    Some(_) => {}
                    None => {
                        observations.insert(key, (obs.strength, obs.unit_cost));
                    }
                }
            }

            if let Some(terms) = parsed.coverage {
                let insurer = InsurerId::new(&terms.insurer);
                insurers.entry(insurer.clone()).or_insert_with(|| terms.insurer.clone());
                pending_coverage.push((row_number, insurer, drug, terms));
            }
        }

        // Ids follow the (drug, form, strength, date) order of the map.
        let mut medications: BTreeMap<DrugId, Vec<MedicationRecord>> = BTreeMap::new();
        for (index, ((drug, form, _, observed_on), (strength, unit_cost))) in
            observations.into_iter().enumerate()
        {
            medications.entry(drug.clone()).or_default().push(MedicationRecord {
                id: RecordId::medication(index + 1),
                drug,
                strength,
                form,
                unit_cost,
                observed_on,
            });
        }
        for records in medications.values_mut() {
            records.sort_by(|a, b| a.observed_on.cmp(&b.observed_on).then_with(|| a.id.cmp(&b.id)));
        }

        // Generics may name drugs from later rows, so they resolve after the scan
        for (row_number, drug, name) in pending_generics {
            let generic = names
                .get(&normalize_name(&name))
                .filter(|generic| **generic != drug)
                .cloned()
                .ok_or_else(|| DatasetError::UnknownGeneric {
                    row: row_number,
                    drug: drug.clone(),
                    generic: name.clone(),
                })?;
            if let Some(entry) = drugs.get_mut(&drug) {
                if let Some(first) = entry.generic.as_ref().filter(|first| **first != generic) {
                    return Err(DatasetError::GenericConflict {
                        drug,
                        first: first.clone(),
                        second: generic,
                    });
                }
                entry.generic = Some(generic);
            }
        }

        let mut coverage_records = Vec::with_capacity(pending_coverage.len());
        for (row_number, insurer, drug, terms) in pending_coverage {
            if !medications.contains_key(&drug) {
                return Err(DatasetError::UnknownCoverageDrug {
                    row: row_number,
                    drug,
                });
            }
            coverage_records.push(CoverageRecord {
                id: RecordId::coverage(0),
                insurer,
                drug,
                tier: terms.tier,
                copay: terms.copay,
                status: terms.status,
                effective_from: terms.effective_from,
                effective_until: terms.effective_until,
            });
        }
        coverage_records.sort_by(|a, b| {
            (&a.insurer, &a.drug, a.effective_from, a.effective_until, a.tier, a.status)
                .cmp(&(&b.insurer, &b.drug, b.effective_from, b.effective_until, b.tier, b.status))
                .then_with(|| a.copay.describe().cmp(&b.copay.describe()))
        });
        coverage_records.dedup();

        let mut coverage: BTreeMap<(InsurerId, DrugId), Vec<CoverageRecord>> = BTreeMap::new();
        for (index, mut record) in coverage_records.into_iter().enumerate() {
            record.id = RecordId::coverage(index + 1);
            coverage
                .entry((record.insurer.clone(), record.drug.clone()))
                .or_default()
                .push(record);
        }

        let mut model = Self {
            drugs,
            names,
            medications,
            coverage,
            insurers,
            fingerprint: String::new(),
        };
        model.fingerprint = model.compute_fingerprint();

        tracing::info!(
            drugs = model.drugs.len(),
            medication_records = model.medication_count(),
            coverage_records = model.coverage_count(),
            fingerprint = %model.fingerprint,
            "dataset loaded"
        );
        Ok(model)
    }

    /// Canonical id for an exact name or alias match.
    pub fn canonical_id(&self, name: &str) -> Option<&DrugId> {
        self.names.get(&normalize_name(name))
    }

    /// Look a drug up by canonical name or any alias.
    pub fn lookup(&self, name: &str) -> DrugLookup<'_> {
        match self.canonical_id(name) {
            Some(drug) => DrugLookup::Found {
                drug: drug.clone(),
                records: self.records(drug),
            },
            None => DrugLookup::Unknown {
                name: name.trim().to_string(),
            },
        }
    }

    /// Observations for a canonical id, ordered by date.
    pub fn records(&self, drug: &DrugId) -> &[MedicationRecord] {
        self.medications.get(drug).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Generic equivalent of a brand drug, when the data names one.
    pub fn generic_of(&self, drug: &DrugId) -> Option<&DrugId> {
        self.drugs.get(drug).and_then(|entry| entry.generic.as_ref())
    }

    /// Most recent observation with a known cost.
    pub fn latest_priced(&self, drug: &DrugId) -> Option<&MedicationRecord> {
        self.latest_priced_on(drug, None)
    }

    /// Most recent observation with a known cost on or before `as_of`.
    pub fn latest_priced_on(&self, drug: &DrugId, as_of: Option<NaiveDate>) -> Option<&MedicationRecord> {
        self.records(drug)
            .iter()
            .rev()
            .filter(|r| as_of.map_or(true, |d| r.observed_on <= d))
            .find(|r| r.unit_cost.is_some())
    }

    /// Coverage records for a drug, optionally restricted to one insurer.
    ///
    /// Ordered by insurer, then effective date.
    pub fn coverage_for(&self, drug: &DrugId, insurer: Option<&InsurerId>) -> Vec<&CoverageRecord> {
        self.coverage
            .iter()
            .filter(|((ins, d), _)| d == drug && insurer.map_or(true, |wanted| ins == wanted))
            .flat_map(|(_, records)| records.iter())
            .collect()
    }

    pub fn drug(&self, id: &DrugId) -> Option<&DrugEntry> {
        self.drugs.get(id)
    }

    pub fn drugs(&self) -> impl Iterator<Item = &DrugEntry> {
        self.drugs.values()
    }

    /// Every normalized name and alias with the drug it belongs to.
    pub fn names(&self) -> &BTreeMap<String, DrugId> {
        &self.names
    }

    /// Display names and aliases, for prompting.
    pub fn vocabulary(&self) -> Vec<String> {
        self.drugs
            .values()
            .flat_map(|entry| std::iter::once(entry.display_name.clone()).chain(entry.aliases.iter().cloned()))
            .collect()
    }

    /// Case-insensitive insurer match.
    pub fn insurer_id(&self, name: &str) -> Option<InsurerId> {
        let id = InsurerId::new(name);
        self.insurers.contains_key(&id).then_some(id)
    }

    /// Insurer display names in id order.
    pub fn insurer_names(&self) -> Vec<String> {
        self.insurers.values().cloned().collect()
    }

    pub fn insurer_display(&self, id: &InsurerId) -> String {
        self.insurers
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn drug_display(&self, id: &DrugId) -> String {
        self.drugs
            .get(id)
            .map(|e| e.display_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn medication_count(&self) -> usize {
        self.medications.values().map(Vec::len).sum()
    }

    pub fn coverage_count(&self) -> usize {
        self.coverage.values().map(Vec::len).sum()
    }

    /// SHA-256 hex digest of the canonical content.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn summary(&self) -> DatasetSummary {
        let latest: Vec<f64> = self
            .drugs
            .keys()
            .filter_map(|d| self.latest_priced(d).and_then(|r| r.unit_cost))
            .collect();
        let mean_latest_unit_cost = if latest.is_empty() {
            None
        } else {
            Some(crate::models::round_cents(latest.iter().sum::<f64>() / latest.len() as f64))
        };

        DatasetSummary {
            drug_count: self.drugs.len(),
            insurers: self.insurer_names(),
            medication_records: self.medication_count(),
            coverage_records: self.coverage_count(),
            missing_costs: self
                .medications
                .values()
                .flatten()
                .filter(|r| r.unit_cost.is_none())
                .count(),
            mean_latest_unit_cost,
            drugs_with_generic: self.drugs.values().filter(|d| d.generic.is_some()).count(),
            by_insurer: self.insurer_summaries(),
        }
    }

    fn insurer_summaries(&self) -> Vec<InsurerSummary> {
        let mut summaries: BTreeMap<&InsurerId, InsurerSummary> = BTreeMap::new();
        let mut percents: BTreeMap<&InsurerId, Vec<f64>> = BTreeMap::new();
        for record in self.coverage.values().flatten() {
            let summary = summaries.entry(&record.insurer).or_insert_with(|| InsurerSummary {
                insurer: self.insurer_display(&record.insurer),
                coverage_records: 0,
                covered: 0,
                prior_authorization: 0,
                step_therapy: 0,
                not_covered: 0,
                min_copay: None,
                max_copay: None,
                mean_coinsurance_pct: None,
            });
            summary.coverage_records += 1;
            match record.status {
                CoverageStatus::Covered => summary.covered += 1,
                CoverageStatus::PriorAuthorizationRequired => summary.prior_authorization += 1,
                CoverageStatus::StepTherapyRequired => summary.step_therapy += 1,
                CoverageStatus::NotCovered => summary.not_covered += 1,
            }
            let (floor, cap) = match record.copay {
                CopayRule::Flat { amount } => (Some(amount), Some(amount)),
                CopayRule::Coinsurance {
                    percent,
                    min_copay,
                    max_copay,
                } => {
                    percents.entry(&record.insurer).or_default().push(percent);
                    (min_copay, max_copay)
                }
                CopayRule::Unspecified => (None, None),
            };
            if let Some(floor) = floor {
                summary.min_copay = Some(summary.min_copay.map_or(floor, |m| m.min(floor)));
            }
            if let Some(cap) = cap {
                summary.max_copay = Some(summary.max_copay.map_or(cap, |m| m.max(cap)));
            }
        }
        for (insurer, values) in percents {
            if let Some(summary) = summaries.get_mut(insurer) {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                summary.mean_coinsurance_pct = Some((mean * 10.0).round() / 10.0);
            }
        }
        summaries.into_values().collect()
    }

    fn compute_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in self.drugs.values() {
            let aliases: BTreeSet<String> = entry.aliases.iter().map(|a| normalize_name(a)).collect();
            hasher.update(format!("D|{}|{:?}|{:?}\n", entry.id, aliases, entry.generic));
        }
        for record in self.medications.values().flatten() {
            hasher.update(format!(
                "M|{}|{}|{:?}|{:?}|{:?}|{}\n",
                record.id, record.drug, record.form, record.strength, record.unit_cost, record.observed_on
            ));
        }
        for record in self.coverage.values().flatten() {
            hasher.update(format!(
                "C|{}|{}|{}|{}|{:?}|{:?}|{}|{:?}\n",
                record.id,
                record.insurer,
                record.drug,
                record.tier,
                record.copay,
                record.status,
                record.effective_from,
                record.effective_until
            ));
        }
        hex::encode(hasher.finalize())
    }
}

/// Hex SHA-256 of arbitrary bytes.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn register_name(names: &mut BTreeMap<String, DrugId>, name: &str, drug: &DrugId) -> DatasetResult<()> {
    let key = normalize_name(name);
    if key.is_empty() {
        return Ok(());
    }
    match names.get(&key) {
        Some(existing) if existing != drug => Err(DatasetError::AliasConflict {
            alias: key,
            first: existing.clone(),
            second: drug.clone(),
        }),
        Some(_) => Ok(()),
        None => {
            names.insert(key, drug.clone());
            Ok(())
        }
    }
}
