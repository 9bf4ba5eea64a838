use super::*;

fn user(id: &str, name: &str) -> UserSummary {
    UserSummary {
        id: UserId::from(id),
        name: name.to_string(),
        username: name.to_lowercase(),
        avatar_url: String::new(),
    }
}

fn directory() -> Vec<UserSummary> {
    vec![
        user("1", "Zoe"),
        user("2", "ana"),
        user("3", "Bruno"),
        user("4", "Marta"),
        user("5", "Carlos"),
    ]
}

fn names(entries: &[PresenceEntry]) -> Vec<(&str, bool)> {
    entries
        .iter()
        .map(|e| (e.name.as_str(), e.is_online))
        .collect()
}

#[test]
fn members_sort_online_first_then_by_name() {
    let mut presence = PresenceAggregator::default();
    presence.set_directory(directory());
    presence.replace_online(vec![user("1", "Zoe"), user("4", "Marta")]);

    assert_eq!(
        names(&presence.members()),
        vec![
            ("Marta", true),
            ("Zoe", true),
            ("ana", false),
            ("Bruno", false),
            ("Carlos", false),
        ]
    );
}

#[test]
fn presence_sort_property_holds_for_every_online_subset() {
    let roster = directory();
    for mask in 0u32..(1 << roster.len()) {
        let online: Vec<UserSummary> = roster
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, u)| u.clone())
            .collect();
        let mut presence = PresenceAggregator::default();
        presence.set_directory(roster.clone());
        presence.replace_online(online.clone());

        let members = presence.members();
        assert_eq!(members.len(), roster.len());
        for pair in members.windows(2) {
            assert_ne!(member_order(&pair[0], &pair[1]), Ordering::Greater);
        }
        let online_count = members.iter().filter(|m| m.is_online).count();
        assert_eq!(online_count, online.len());
        assert!(members[..online_count].iter().all(|m| m.is_online));
    }
}

#[test]
fn online_snapshot_replaces_wholesale_and_dedups() {
    let mut presence = PresenceAggregator::default();
    presence.replace_online(vec![user("1", "Zoe"), user("2", "ana")]);
    presence.replace_online(vec![
        user("3", "Bruno"),
        user("3", "Bruno (dup)"),
        user("4", "Marta"),
    ]);

    let online: Vec<&str> = presence.online_users().iter().map(|u| u.name.as_str()).collect();
    assert_eq!(online, vec!["Bruno", "Marta"]);
    assert!(!presence.is_online(&UserId::from("1")));
}

#[test]
fn online_users_outside_directory_are_not_listed() {
    let mut presence = PresenceAggregator::default();
    presence.set_directory(vec![user("1", "Zoe")]);
    presence.replace_online(vec![user("99", "Ghost")]);
    assert_eq!(names(&presence.members()), vec![("Zoe", false)]);
}

#[test]
fn clearing_online_set_marks_everyone_offline() {
    let mut presence = PresenceAggregator::default();
    presence.set_directory(directory());
    presence.replace_online(directory());
    presence.clear_online();
    assert!(presence.members().iter().all(|m| !m.is_online));
    assert!(presence.online_users().is_empty());
}

#[test]
fn typing_true_then_false_round_trips() {
    let mut presence = PresenceAggregator::default();
    let now = Instant::now();
    assert!(presence.set_typing("ana", true, now));
    assert!(!presence.set_typing("ana", true, now));
    assert_eq!(presence.typing_users(now), vec!["ana".to_string()]);
    assert!(presence.set_typing("ana", false, now));
    assert!(presence.typing_users(now).is_empty());
}

#[test]
fn typing_entry_expires_without_renewal() {
    let mut presence = PresenceAggregator::default();
    let start = Instant::now();
    presence.set_typing("ana", true, start);

    assert_eq!(
        presence.typing_users(start + Duration::from_millis(1500)),
        vec!["ana".to_string()]
    );
    let later = start + Duration::from_millis(2500);
    assert!(presence.typing_users(later).is_empty());
    assert!(presence.prune_typing(later));
    assert_eq!(presence.typing_deadline("ana"), None);
}

#[test]
fn renewal_pushes_deadline_forward() {
    let mut presence = PresenceAggregator::default();
    let start = Instant::now();
    presence.set_typing("ana", true, start);
    presence.set_typing("ana", true, start + Duration::from_millis(1500));
    assert_eq!(
        presence.typing_users(start + Duration::from_millis(2500)),
        vec!["ana".to_string()]
    );
    assert!(presence
        .typing_users(start + Duration::from_millis(3600))
        .is_empty());
}
