use chrono::{DateTime, Utc};
use rusqlite::params;

use super::types::{from_unix, null_if_empty, unix, Group, GroupParticipant};
use super::Store;
use crate::errors::Result;

impl Store {
    pub fn upsert_group(
        &self,
        jid: &str,
        name: &str,
        owner_jid: &str,
        created: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            "INSERT INTO groups(jid, name, owner_jid, created_ts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(jid) DO UPDATE SET
                 name       = COALESCE(NULLIF(excluded.name,''), groups.name),
                 owner_jid  = COALESCE(NULLIF(excluded.owner_jid,''), groups.owner_jid),
                 created_ts = COALESCE(NULLIF(excluded.created_ts,0), groups.created_ts),
                 updated_at = excluded.updated_at",
            params![jid, name, owner_jid, unix(created), now],
        )?;
        Ok(())
    }

    /// Replace the participant set for one group in a single transaction.
    /// On any failure the transaction rolls back and the previous snapshot
    /// stays intact.
    pub fn replace_group_participants(
        &self,
        group_jid: &str,
        participants: &[GroupParticipant],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();

        tx.execute(
            "DELETE FROM group_participants WHERE group_jid = ?1",
            params![group_jid],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO group_participants(group_jid, user_jid, role, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for p in participants {
                let role = null_if_empty(&p.role).unwrap_or("member");
                stmt.execute(params![group_jid, p.user_jid, role, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_groups(&self, query: &str, limit: usize) -> Result<Vec<Group>> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn();

        let mut sql = String::from(
            "SELECT jid, COALESCE(name,''), COALESCE(owner_jid,''), COALESCE(created_ts,0), updated_at
             FROM groups WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(q) = null_if_empty(query) {
            sql.push_str(" AND (LOWER(name) LIKE LOWER(?) OR LOWER(jid) LIKE LOWER(?))");
            let needle = format!("%{q}%");
            args.push(Box::new(needle.clone()));
            args.push(Box::new(needle));
        }
        sql.push_str(" ORDER BY COALESCE(created_ts,0) DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(Group {
                jid: row.get(0)?,
                name: row.get(1)?,
                owner_jid: row.get(2)?,
                created_at: from_unix(row.get(3)?),
                updated_at: from_unix(row.get(4)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn list_group_participants(&self, group_jid: &str) -> Result<Vec<GroupParticipant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT group_jid, user_jid, role FROM group_participants
             WHERE group_jid = ?1 ORDER BY user_jid",
        )?;
        let rows = stmt.query_map(params![group_jid], |row| {
            Ok(GroupParticipant {
                group_jid: row.get(0)?,
                user_jid: row.get(1)?,
                role: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn participant(group: &str, user: &str, role: &str) -> GroupParticipant {
        GroupParticipant {
            group_jid: group.into(),
            user_jid: user.into(),
            role: role.into(),
        }
    }

    #[test]
    fn replace_is_total_not_incremental() {
        let s = Store::open_in_memory().unwrap();
        let g = "123@g.us";
        s.upsert_group(g, "Team", "boss@s.whatsapp.net", None)
            .unwrap();

        s.replace_group_participants(
            g,
            &[
                participant(g, "a@s.whatsapp.net", "member"),
                participant(g, "b@s.whatsapp.net", "admin"),
            ],
        )
        .unwrap();

        s.replace_group_participants(g, &[participant(g, "c@s.whatsapp.net", "superadmin")])
            .unwrap();

        let ps = s.list_group_participants(g).unwrap();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].user_jid, "c@s.whatsapp.net");
        assert_eq!(ps[0].role, "superadmin");
    }

    #[test]
    fn blank_role_defaults_to_member() {
        let s = Store::open_in_memory().unwrap();
        let g = "123@g.us";
        s.replace_group_participants(g, &[participant(g, "a@s.whatsapp.net", " ")])
            .unwrap();
        assert_eq!(s.list_group_participants(g).unwrap()[0].role, "member");
    }

    #[test]
    fn failed_replace_keeps_prior_snapshot() {
        let s = Store::open_in_memory().unwrap();
        let g = "123@g.us";
        s.replace_group_participants(g, &[participant(g, "a@s.whatsapp.net", "member")])
            .unwrap();

        // Duplicate user_jid violates the primary key mid-transaction.
        let dup = vec![
            participant(g, "b@s.whatsapp.net", "member"),
            participant(g, "b@s.whatsapp.net", "admin"),
        ];
        assert!(s.replace_group_participants(g, &dup).is_err());

        let ps = s.list_group_participants(g).unwrap();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].user_jid, "a@s.whatsapp.net");
    }

    #[test]
    fn group_fields_widen() {
        let s = Store::open_in_memory().unwrap();
        let created = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        s.upsert_group("g@g.us", "Name", "o@s.whatsapp.net", Some(created))
            .unwrap();
        s.upsert_group("g@g.us", "", "", None).unwrap();
        let gs = s.list_groups("Name", 10).unwrap();
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0].owner_jid, "o@s.whatsapp.net");
        assert_eq!(gs[0].created_at, Some(created));
    }

    #[test]
    fn list_groups_filters_by_name_or_jid() {
        let s = Store::open_in_memory().unwrap();
        s.upsert_group("1@g.us", "Alpha", "", None).unwrap();
        s.upsert_group("2@g.us", "Beta", "", None).unwrap();
        assert_eq!(s.list_groups("alpha", 10).unwrap().len(), 1);
        assert_eq!(s.list_groups("2@g.us", 10).unwrap().len(), 1);
        assert_eq!(s.list_groups("", 10).unwrap().len(), 2);
    }
}
