//! Contact and group bootstrap: pull full snapshots from the session and
//! persist them. Used by `contacts refresh`, `groups refresh` and the sync
//! loop's `--refresh-*` options.

use super::App;
use crate::errors::Result;
use crate::store::{GroupParticipant, Store};
use crate::wa::GroupSnapshot;

impl App {
    /// Import every contact the session knows about. Returns the count.
    pub async fn refresh_contacts(&self) -> Result<usize> {
        let wa = self.wa()?;
        let contacts = wa.get_all_contacts().await?;
        let mut count = 0usize;
        for c in &contacts {
            if let Err(e) = self.store.upsert_contact(
                &c.jid,
                &c.phone,
                &c.push_name,
                &c.full_name,
                &c.first_name,
                &c.business_name,
            ) {
                tracing::warn!("import contact {}: {e}", c.jid);
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Fetch joined groups live and persist each one plus its chat row.
    pub async fn refresh_groups(&self) -> Result<usize> {
        let wa = self.wa()?;
        let groups = wa.get_joined_groups().await?;
        for g in &groups {
            if let Err(e) = self.persist_group(g) {
                tracing::warn!("import group {}: {e}", g.jid);
                continue;
            }
            self.store
                .upsert_chat(&g.jid, "group", &g.name, Some(chrono::Utc::now()))?;
        }
        Ok(groups.len())
    }

    /// Group row plus atomic participant replacement, one logical unit.
    pub fn persist_group(&self, info: &GroupSnapshot) -> Result<()> {
        persist_group_snapshot(&self.store, info)
    }
}

pub(crate) fn persist_group_snapshot(store: &Store, info: &GroupSnapshot) -> Result<()> {
    store.upsert_group(&info.jid, &info.name, &info.owner_jid, info.created_at)?;
    let participants: Vec<GroupParticipant> = info
        .participants
        .iter()
        .map(|p| GroupParticipant {
            group_jid: info.jid.clone(),
            user_jid: p.jid.clone(),
            role: p.role().to_string(),
        })
        .collect();
    store.replace_group_participants(&info.jid, &participants)
}
