use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use serde::Serialize;

use crate::model::TermRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTerm {
    pub id: i64,
    pub slug: String,
}

/// Fields written to the target store for one term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermPayload {
    pub name: String,
    pub slug: String,
    pub description: String,
    pub parent: i64,
    pub term_group: i64,
}

impl TermPayload {
    pub fn from_record(record: &TermRecord, parent: i64) -> Self {
        Self {
            name: record.name.clone(),
            slug: record.slug.clone(),
            description: record.description.clone(),
            parent,
            term_group: record.term_group,
        }
    }
}

/// The target installation's taxonomy layer. Every call is blocking.
pub trait TaxonomyStore {
    fn list_registered_taxonomies(&mut self) -> Result<BTreeSet<String>>;
    fn list_terms(&mut self, taxonomy: &str) -> Result<Vec<StoredTerm>>;
    fn insert_term(&mut self, name: &str, taxonomy: &str, payload: &TermPayload) -> Result<i64>;
    fn update_term(&mut self, id: i64, taxonomy: &str, payload: &TermPayload) -> Result<()>;
    /// Adds `terms` to the object's terms in `taxonomy`; existing assignments stay.
    fn set_object_terms(&mut self, object_id: i64, terms: &[String], taxonomy: &str)
    -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTerm {
    pub id: i64,
    pub taxonomy: String,
    pub payload: TermPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreWrite {
    Insert {
        taxonomy: String,
        id: i64,
        slug: String,
        parent: i64,
    },
    Update {
        taxonomy: String,
        id: i64,
        slug: String,
        parent: i64,
    },
    Assign {
        taxonomy: String,
        object_id: i64,
        terms: Vec<String>,
    },
}

/// In-process store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    registered: BTreeSet<String>,
    terms: Vec<MemoryTerm>,
    object_terms: BTreeMap<(i64, String), BTreeSet<String>>,
    writes: Vec<StoreWrite>,
    next_id: i64,
    request_count: usize,
}

impl MemoryStore {
    pub fn with_registered<I, T>(taxonomies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            registered: taxonomies.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn register(&mut self, taxonomy: &str) {
        self.registered.insert(taxonomy.to_string());
    }

    /// Adds a term as if it existed before the run. Not counted as a write.
    pub fn seed_term(&mut self, taxonomy: &str, slug: &str, name: &str) -> i64 {
        let id = self.allocate_id();
        self.terms.push(MemoryTerm {
            id,
            taxonomy: taxonomy.to_string(),
            payload: TermPayload {
                name: name.to_string(),
                slug: slug.to_string(),
                description: String::new(),
                parent: 0,
                term_group: 0,
            },
        });
        id
    }

    pub fn terms(&self, taxonomy: &str) -> Vec<&MemoryTerm> {
        self.terms
            .iter()
            .filter(|term| term.taxonomy == taxonomy)
            .collect()
    }

    pub fn term_by_slug(&self, taxonomy: &str, slug: &str) -> Option<&MemoryTerm> {
        self.terms
            .iter()
            .find(|term| term.taxonomy == taxonomy && term.payload.slug == slug)
    }

    pub fn object_terms(&self, object_id: i64, taxonomy: &str) -> BTreeSet<String> {
        self.object_terms
            .get(&(object_id, taxonomy.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn writes(&self) -> &[StoreWrite] {
        &self.writes
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_registered(&self, taxonomy: &str) -> Result<()> {
        if !self.registered.contains(taxonomy) {
            bail!("invalid taxonomy: {taxonomy}");
        }
        Ok(())
    }
}

impl TaxonomyStore for MemoryStore {
    fn list_registered_taxonomies(&mut self) -> Result<BTreeSet<String>> {
        self.request_count += 1;
        Ok(self.registered.clone())
    }

    fn list_terms(&mut self, taxonomy: &str) -> Result<Vec<StoredTerm>> {
        self.request_count += 1;
        self.ensure_registered(taxonomy)?;
        Ok(self
            .terms(taxonomy)
            .into_iter()
            .map(|term| StoredTerm {
                id: term.id,
                slug: term.payload.slug.clone(),
            })
            .collect())
    }

    fn insert_term(&mut self, name: &str, taxonomy: &str, payload: &TermPayload) -> Result<i64> {
        self.request_count += 1;
        self.ensure_registered(taxonomy)?;
        if self.term_by_slug(taxonomy, &payload.slug).is_some() {
            bail!("term slug `{}` already exists in {taxonomy}", payload.slug);
        }
        if payload.parent != 0
            && !self
                .terms
                .iter()
                .any(|term| term.id == payload.parent && term.taxonomy == taxonomy)
        {
            bail!("parent term {} does not exist in {taxonomy}", payload.parent);
        }
        let id = self.allocate_id();
        let mut payload = payload.clone();
        payload.name = name.to_string();
        self.writes.push(StoreWrite::Insert {
            taxonomy: taxonomy.to_string(),
            id,
            slug: payload.slug.clone(),
            parent: payload.parent,
        });
        self.terms.push(MemoryTerm {
            id,
            taxonomy: taxonomy.to_string(),
            payload,
        });
        Ok(id)
    }

    fn update_term(&mut self, id: i64, taxonomy: &str, payload: &TermPayload) -> Result<()> {
        self.request_count += 1;
        self.ensure_registered(taxonomy)?;
        let Some(term) = self
            .terms
            .iter_mut()
            .find(|term| term.id == id && term.taxonomy == taxonomy)
        else {
            bail!("term {id} does not exist in {taxonomy}");
        };
        term.payload = payload.clone();
        self.writes.push(StoreWrite::Update {
            taxonomy: taxonomy.to_string(),
            id,
            slug: payload.slug.clone(),
            parent: payload.parent,
        });
        Ok(())
    }

    fn set_object_terms(
        &mut self,
        object_id: i64,
        terms: &[String],
        taxonomy: &str,
    ) -> Result<()> {
        self.request_count += 1;
        self.ensure_registered(taxonomy)?;
        self.object_terms
            .entry((object_id, taxonomy.to_string()))
            .or_default()
            .extend(terms.iter().cloned());
        self.writes.push(StoreWrite::Assign {
            taxonomy: taxonomy.to_string(),
            object_id,
            terms: terms.to_vec(),
        });
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}
