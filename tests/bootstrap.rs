//! Contact and group refresh against the fake client.

mod common;

use anyhow::Result;
use chrono::{TimeZone, Utc};

use common::test_app;
use wacli::wa::{ContactSnapshot, GroupSnapshot, ParticipantSnapshot};

#[tokio::test]
async fn refresh_contacts_stores_a_displayable_name() -> Result<()> {
    let (_dir, app, fake) = test_app();
    fake.contacts.lock().push(ContactSnapshot {
        jid: "111@s.whatsapp.net".into(),
        phone: "111".into(),
        push_name: "Push".into(),
        full_name: "Full Name".into(),
        first_name: "First".into(),
        business_name: String::new(),
    });

    let count = app.refresh_contacts().await?;
    assert_eq!(count, 1);

    let contact = app.store().get_contact("111@s.whatsapp.net")?;
    assert!(!contact.name.is_empty(), "expected a stored contact name");
    assert_eq!(contact.name, "Full Name");
    assert_eq!(contact.phone, "111");
    Ok(())
}

#[tokio::test]
async fn refresh_groups_stores_group_chat_and_participants() -> Result<()> {
    let (_dir, app, fake) = test_app();
    fake.groups.lock().push(GroupSnapshot {
        jid: "12345@g.us".into(),
        name: "MyGroup".into(),
        owner_jid: "999@s.whatsapp.net".into(),
        created_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        participants: vec![
            ParticipantSnapshot {
                jid: "999@s.whatsapp.net".into(),
                is_admin: false,
                is_superadmin: true,
            },
            ParticipantSnapshot {
                jid: "111@s.whatsapp.net".into(),
                is_admin: false,
                is_superadmin: false,
            },
        ],
    });

    let count = app.refresh_groups().await?;
    assert_eq!(count, 1);

    let groups = app.store().list_groups("MyGroup", 10)?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].jid, "12345@g.us");
    assert_eq!(groups[0].owner_jid, "999@s.whatsapp.net");

    let chat = app.store().get_chat("12345@g.us")?;
    assert_eq!(chat.kind, "group");

    let participants = app.store().list_group_participants("12345@g.us")?;
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[1].role, "superadmin");
    Ok(())
}

#[tokio::test]
async fn refresh_replaces_the_participant_snapshot() -> Result<()> {
    let (_dir, app, fake) = test_app();
    let group = GroupSnapshot {
        jid: "12345@g.us".into(),
        name: "MyGroup".into(),
        owner_jid: String::new(),
        created_at: None,
        participants: vec![ParticipantSnapshot {
            jid: "a@s.whatsapp.net".into(),
            is_admin: false,
            is_superadmin: false,
        }],
    };
    fake.groups.lock().push(group.clone());
    app.refresh_groups().await?;

    // Server-side membership changed wholesale; the local snapshot follows.
    {
        let mut groups = fake.groups.lock();
        groups[0].participants = vec![ParticipantSnapshot {
            jid: "b@s.whatsapp.net".into(),
            is_admin: true,
            is_superadmin: false,
        }];
    }
    app.refresh_groups().await?;

    let participants = app.store().list_group_participants("12345@g.us")?;
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].user_jid, "b@s.whatsapp.net");
    assert_eq!(participants[0].role, "admin");
    Ok(())
}
