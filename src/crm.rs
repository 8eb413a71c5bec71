use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CRM read model for lead lookups. The pipeline/kanban UI owns the full
/// record; action nodes only need identity and age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("lead {0} not found")]
    LeadNotFound(String),
    #[error("crm unavailable: {0}")]
    Unavailable(String),
}

/// Lead mutations invoked by action nodes. All calls are best-effort from the
/// interpreter's point of view: failures are logged, never propagated.
#[async_trait]
pub trait CrmMutator: Send + Sync + Debug {
    /// Suffix-tolerant lookup; on duplicates the oldest lead wins.
    async fn find_lead_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Lead>, CrmError>;

    async fn move_lead_to_stage(&self, lead_id: &str, stage_id: &str) -> Result<(), CrmError>;

    async fn add_tag(&self, lead_id: &str, tag: &str) -> Result<(), CrmError>;

    async fn remove_tag(&self, lead_id: &str, tag: &str) -> Result<(), CrmError>;
}

const SUFFIX_LEN: usize = 8;

/// Phone equality tolerant of country-code and ninth-digit variations: two
/// numbers match when the last eight digits of one are a suffix of the other.
pub fn phones_match(a: &str, b: &str) -> bool {
    let da = digits(a);
    let db = digits(b);
    if da.is_empty() || db.is_empty() {
        return false;
    }
    let sa = suffix(&da);
    let sb = suffix(&db);
    da.ends_with(sb) || db.ends_with(sa)
}

fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

fn suffix(digits: &str) -> &str {
    let start = digits.len().saturating_sub(SUFFIX_LEN);
    &digits[start..]
}

#[derive(Debug, Clone)]
struct LeadRecord {
    lead: Lead,
    stage_id: Option<String>,
    tags: Vec<String>,
}

/// DashMap-backed CRM used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemoryCrm {
    leads: DashMap<String, LeadRecord>,
    fail_mutations: AtomicBool,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lead(&self, lead: Lead) {
        self.leads
            .insert(lead.id.clone(), LeadRecord { lead, stage_id: None, tags: Vec::new() });
    }

    /// When set, every mutation reports `CrmError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.fail_mutations.store(failing, Ordering::SeqCst);
    }

    pub fn stage_of(&self, lead_id: &str) -> Option<String> {
        self.leads.get(lead_id).and_then(|r| r.stage_id.clone())
    }

    pub fn tags_of(&self, lead_id: &str) -> Vec<String> {
        self.leads.get(lead_id).map(|r| r.tags.clone()).unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), CrmError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            Err(CrmError::Unavailable("in-memory crm set to fail".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CrmMutator for InMemoryCrm {
    async fn find_lead_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Lead>, CrmError> {
        let mut matches: Vec<Lead> = self
            .leads
            .iter()
            .filter(|r| r.lead.tenant_id == tenant_id && phones_match(&r.lead.phone, phone))
            .map(|r| r.lead.clone())
            .collect();
        matches.sort_by_key(|l| l.created_at);
        Ok(matches.into_iter().next())
    }

    async fn move_lead_to_stage(&self, lead_id: &str, stage_id: &str) -> Result<(), CrmError> {
        self.check_available()?;
        let mut record = self
            .leads
            .get_mut(lead_id)
            .ok_or_else(|| CrmError::LeadNotFound(lead_id.to_string()))?;
        record.stage_id = Some(stage_id.to_string());
        Ok(())
    }

    async fn add_tag(&self, lead_id: &str, tag: &str) -> Result<(), CrmError> {
        self.check_available()?;
        let mut record = self
            .leads
            .get_mut(lead_id)
            .ok_or_else(|| CrmError::LeadNotFound(lead_id.to_string()))?;
        if !record.tags.iter().any(|t| t == tag) {
            record.tags.push(tag.to_string());
        }
        Ok(())
    }

    async fn remove_tag(&self, lead_id: &str, tag: &str) -> Result<(), CrmError> {
        self.check_available()?;
        let mut record = self
            .leads
            .get_mut(lead_id)
            .ok_or_else(|| CrmError::LeadNotFound(lead_id.to_string()))?;
        record.tags.retain(|t| t != tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lead(id: &str, phone: &str, age_mins: i64) -> Lead {
        Lead {
            id: id.into(),
            tenant_id: "t1".into(),
            phone: phone.into(),
            created_at: Utc::now() - Duration::minutes(age_mins),
        }
    }

    #[test]
    fn test_phones_match_suffix_tolerant() {
        // with vs without the 55 country code
        assert!(phones_match("5511999998888", "11999998888"));
        // formatted vs raw
        assert!(phones_match("+55 (11) 99999-8888", "5511999998888"));
        // ninth digit dropped by the carrier
        assert!(phones_match("551199998888", "99998888"));
        assert!(!phones_match("5511999998888", "5511888887777"));
        assert!(!phones_match("", "11999998888"));
    }

    #[tokio::test]
    async fn test_find_lead_prefers_oldest_duplicate() {
        let crm = InMemoryCrm::new();
        crm.add_lead(lead("newer", "5511999998888", 5));
        crm.add_lead(lead("older", "11999998888", 500));

        let found = crm.find_lead_by_phone("t1", "+5511999998888").await.unwrap().unwrap();
        assert_eq!(found.id, "older");
    }

    #[tokio::test]
    async fn test_find_lead_scoped_to_tenant() {
        let crm = InMemoryCrm::new();
        let mut other = lead("foreign", "5511999998888", 10);
        other.tenant_id = "t2".into();
        crm.add_lead(other);

        assert!(crm.find_lead_by_phone("t1", "5511999998888").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tag_mutations() {
        let crm = InMemoryCrm::new();
        crm.add_lead(lead("l1", "11999998888", 0));

        crm.add_tag("l1", "hot").await.unwrap();
        crm.add_tag("l1", "hot").await.unwrap(); // idempotent
        assert_eq!(crm.tags_of("l1"), vec!["hot".to_string()]);

        crm.remove_tag("l1", "hot").await.unwrap();
        assert!(crm.tags_of("l1").is_empty());

        crm.move_lead_to_stage("l1", "stage-2").await.unwrap();
        assert_eq!(crm.stage_of("l1").as_deref(), Some("stage-2"));
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let crm = InMemoryCrm::new();
        crm.add_lead(lead("l1", "11999998888", 0));
        crm.set_failing(true);
        assert!(crm.add_tag("l1", "hot").await.is_err());
    }
}
