use rusqlite::params;

use super::types::{from_unix, null_if_empty, Contact};
use super::Store;
use crate::errors::{row_or_not_found, Error, Result};

/// Display name preference, first non-empty wins. Alias is surfaced as its
/// own column; the stored name fields collapse in this order.
const NAME_EXPR: &str = "COALESCE(NULLIF(c.full_name,''), NULLIF(c.push_name,''), \
     NULLIF(c.business_name,''), NULLIF(c.first_name,''), '')";

impl Store {
    /// Widening contact upsert: each name field keeps its old value unless
    /// the incoming one is non-empty.
    pub fn upsert_contact(
        &self,
        jid: &str,
        phone: &str,
        push_name: &str,
        full_name: &str,
        first_name: &str,
        business_name: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            "INSERT INTO contacts(jid, phone, push_name, full_name, first_name, business_name, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(jid) DO UPDATE SET
                 phone         = COALESCE(NULLIF(excluded.phone,''), contacts.phone),
                 push_name     = COALESCE(NULLIF(excluded.push_name,''), contacts.push_name),
                 full_name     = COALESCE(NULLIF(excluded.full_name,''), contacts.full_name),
                 first_name    = COALESCE(NULLIF(excluded.first_name,''), contacts.first_name),
                 business_name = COALESCE(NULLIF(excluded.business_name,''), contacts.business_name),
                 updated_at    = excluded.updated_at",
            params![jid, phone, push_name, full_name, first_name, business_name, now],
        )?;
        Ok(())
    }

    /// Substring search across alias, every name field, phone and jid.
    pub fn search_contacts(&self, query: &str, limit: usize) -> Result<Vec<Contact>> {
        let Some(q) = null_if_empty(query) else {
            return Err(Error::invalid("query is required"));
        };
        let limit = if limit == 0 { 50 } else { limit };
        let needle = format!("%{q}%");
        let conn = self.conn();

        let sql = format!(
            "SELECT c.jid,
                    COALESCE(c.phone,''),
                    COALESCE(NULLIF(a.alias,''), ''),
                    {NAME_EXPR},
                    c.updated_at
             FROM contacts c
             LEFT JOIN contact_aliases a ON a.jid = c.jid
             WHERE LOWER(COALESCE(a.alias,''))        LIKE LOWER(?1)
                OR LOWER(COALESCE(c.full_name,''))    LIKE LOWER(?1)
                OR LOWER(COALESCE(c.push_name,''))    LIKE LOWER(?1)
                OR LOWER(COALESCE(c.business_name,''))LIKE LOWER(?1)
                OR LOWER(COALESCE(c.first_name,''))   LIKE LOWER(?1)
                OR LOWER(COALESCE(c.phone,''))        LIKE LOWER(?1)
                OR LOWER(c.jid)                       LIKE LOWER(?1)
             ORDER BY COALESCE(NULLIF(a.alias,''), NULLIF(c.full_name,''), NULLIF(c.push_name,''), c.jid)
             LIMIT ?2"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![needle, limit as i64], |row| {
            Ok(Contact {
                jid: row.get(0)?,
                phone: row.get(1)?,
                alias: row.get(2)?,
                name: row.get(3)?,
                tags: Vec::new(),
                updated_at: from_unix(row.get(4)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Single contact with its tag set.
    pub fn get_contact(&self, jid: &str) -> Result<Contact> {
        let sql = format!(
            "SELECT c.jid,
                    COALESCE(c.phone,''),
                    COALESCE(NULLIF(a.alias,''), ''),
                    {NAME_EXPR},
                    c.updated_at
             FROM contacts c
             LEFT JOIN contact_aliases a ON a.jid = c.jid
             WHERE c.jid = ?1"
        );
        let mut contact = {
            let conn = self.conn();
            row_or_not_found(
                conn.query_row(&sql, params![jid], |row| {
                    Ok(Contact {
                        jid: row.get(0)?,
                        phone: row.get(1)?,
                        alias: row.get(2)?,
                        name: row.get(3)?,
                        tags: Vec::new(),
                        updated_at: from_unix(row.get(4)?),
                    })
                }),
                "contact",
            )?
        };
        contact.tags = self.list_tags(jid)?;
        Ok(contact)
    }

    pub fn set_alias(&self, jid: &str, alias: &str) -> Result<()> {
        let Some(alias) = null_if_empty(alias) else {
            return Err(Error::invalid("alias is required"));
        };
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            "INSERT INTO contact_aliases(jid, alias, notes, updated_at)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(jid) DO UPDATE SET alias = excluded.alias, updated_at = excluded.updated_at",
            params![jid, alias, now],
        )?;
        Ok(())
    }

    pub fn remove_alias(&self, jid: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM contact_aliases WHERE jid = ?1", params![jid])?;
        Ok(())
    }

    pub fn add_tag(&self, jid: &str, tag: &str) -> Result<()> {
        let Some(tag) = null_if_empty(tag) else {
            return Err(Error::invalid("tag is required"));
        };
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            "INSERT INTO contact_tags(jid, tag, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(jid, tag) DO UPDATE SET updated_at = excluded.updated_at",
            params![jid, tag, now],
        )?;
        Ok(())
    }

    pub fn remove_tag(&self, jid: &str, tag: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM contact_tags WHERE jid = ?1 AND tag = ?2",
            params![jid, tag],
        )?;
        Ok(())
    }

    pub fn list_tags(&self, jid: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT tag FROM contact_tags WHERE jid = ?1 ORDER BY tag")?;
        let rows = stmt.query_map(params![jid], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
