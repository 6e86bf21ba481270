use crate::db;
use crate::error::ImportError;
use rusqlite::Connection;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    Trimmed,
    CaseInsensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSubject<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub tier: MatchTier,
}

/// Subject catalog snapshot (name -> id), loaded once per import job and
/// never touched again while the job runs.
#[derive(Debug, Clone, Default)]
pub struct SubjectDirectory {
    by_name: BTreeMap<String, String>,
}

impl SubjectDirectory {
    pub fn new<I, N, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            by_name: entries
                .into_iter()
                .map(|(name, id)| (name.into(), id.into()))
                .collect(),
        }
    }

    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let rows = db::subjects_list(conn)?;
        Ok(Self::new(rows.into_iter().map(|s| (s.name, s.id))))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Matches a worksheet title against the catalog: exact, then trimmed,
    /// then case-insensitive. Ties inside a tier go to the first name in
    /// catalog order.
    pub fn resolve(&self, title: &str) -> Result<ResolvedSubject<'_>, ImportError> {
        if let Some((name, id)) = self.by_name.get_key_value(title) {
            return Ok(ResolvedSubject {
                id,
                name,
                tier: MatchTier::Exact,
            });
        }

        let trimmed = title.trim();
        if let Some((name, id)) = self.by_name.iter().find(|(n, _)| n.trim() == trimmed) {
            return Ok(ResolvedSubject {
                id,
                name,
                tier: MatchTier::Trimmed,
            });
        }

        let folded = trimmed.to_lowercase();
        if let Some((name, id)) = self
            .by_name
            .iter()
            .find(|(n, _)| n.trim().to_lowercase() == folded)
        {
            return Ok(ResolvedSubject {
                id,
                name,
                tier: MatchTier::CaseInsensitive,
            });
        }

        Err(ImportError::SubjectResolution {
            title: title.to_string(),
        })
    }
}
