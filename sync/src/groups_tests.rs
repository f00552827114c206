//! Tests for group membership reconciliation and the group lifecycle

use super::*;
use crate::model::*;
use crate::store::{LocalState, MappingStore};
use crate::testing::*;
use o365_sync_core::CourseResetAction;
use proptest::prelude::*;
use rstest::*;
use std::collections::BTreeSet;

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn map_group(world: &TestWorld, subtype: ObjectSubtype, local_id: LocalId, remote_id: &str) {
    world
        .store
        .upsert_mapping(ObjectMapping::new(
            MappingKey::group(subtype, local_id),
            remote_id,
            None,
        ))
        .unwrap();
}

mod membership_plan_tests {
    use super::*;

    #[test]
    fn test_owner_and_member_differences() {
        let plan = MembershipPlan::compute(
            &set(&["A", "B"]),
            &set(&["A", "B", "C"]),
            &set(&["B"]),
            &set(&["B", "D"]),
            true,
        );

        assert_eq!(plan.owners_to_add, vec!["A"]);
        assert!(plan.owners_to_remove.is_empty());
        assert_eq!(plan.members_to_add, vec!["A", "C"]);
        assert_eq!(plan.members_to_remove, vec!["D"]);
    }

    #[test]
    fn test_intended_owner_is_never_removed_as_member() {
        let plan = MembershipPlan::compute(&set(&["A"]), &set(&[]), &set(&["A"]), &set(&["A"]), true);
        assert!(plan.members_to_remove.is_empty());
    }

    #[test]
    fn test_unmanaged_owners_are_left_alone() {
        let plan = MembershipPlan::compute(&set(&[]), &set(&["C"]), &set(&["Z"]), &set(&[]), false);
        assert!(plan.owners_to_remove.is_empty());
        assert_eq!(plan.members_to_add, vec!["C"]);
    }
}

fn apply(plan: &MembershipPlan, owners: &mut BTreeSet<String>, members: &mut BTreeSet<String>) {
    for id in &plan.owners_to_remove {
        owners.remove(id);
    }
    for id in &plan.members_to_remove {
        members.remove(id);
    }
    owners.extend(plan.owners_to_add.iter().cloned());
    members.extend(plan.members_to_add.iter().cloned());
}

fn id_set() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[A-H]", 0..8)
}

proptest! {
    #[test]
    fn test_second_plan_is_empty(
        intended_owners in id_set(),
        intended_members in id_set(),
        mut owners in id_set(),
        mut members in id_set(),
        manage_owners in any::<bool>(),
    ) {
        let first = MembershipPlan::compute(&intended_owners, &intended_members, &owners, &members, manage_owners);
        apply(&first, &mut owners, &mut members);

        let second = MembershipPlan::compute(&intended_owners, &intended_members, &owners, &members, manage_owners);
        prop_assert!(second.is_empty(), "second plan not empty: {:?}", second);
        prop_assert!(intended_members.is_subset(&members));
    }
}

mod reconcile_tests {
    use super::*;

    #[fixture]
    fn world() -> TestWorld {
        let world = create_test_world();
        world.directory.seed_group("g-bio", &["B"], &["B", "D"]);
        map_group(&world, ObjectSubtype::Course, BIOLOGY, "g-bio");
        world
    }

    #[rstest]
    #[tokio::test]
    async fn test_converges_to_local_state(world: TestWorld) {
        let outcome = world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, BIOLOGY)
            .await
            .unwrap();

        assert_eq!(world.directory.owners("g-bio"), set(&["A", "B"]));
        assert_eq!(world.directory.members("g-bio"), set(&["A", "B", "C"]));
        assert_eq!(outcome.removed, vec!["D"]);
        assert_eq!(outcome.metrics.count(Mutation::OwnerAdded), 1);
        assert_eq!(outcome.metrics.count(Mutation::MemberAdded), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_mutation_order(world: TestWorld) {
        world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, BIOLOGY)
            .await
            .unwrap();

        assert_eq!(
            world.directory.write_calls(),
            vec![
                "remove_group_member",
                "add_group_owner",
                "add_group_member",
                "add_group_member"
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_second_run_writes_nothing(world: TestWorld) {
        let groups = &world.service.groups;
        groups.reconcile(ObjectSubtype::Course, BIOLOGY).await.unwrap();
        world.directory.clear_calls();

        let outcome = groups.reconcile(ObjectSubtype::Course, BIOLOGY).await.unwrap();
        assert!(outcome.added.is_empty());
        assert!(outcome.removed.is_empty());
        assert!(world.directory.write_calls().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_mutation_does_not_abort_batch(world: TestWorld) {
        world
            .directory
            .fail_next("add_group_owner", Failure::forbidden(), 1);

        let outcome = world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, BIOLOGY)
            .await
            .unwrap();

        assert_eq!(outcome.metrics.errors.total_errors, 1);
        assert_eq!(world.directory.owners("g-bio"), set(&["B"]));
        assert_eq!(world.directory.members("g-bio"), set(&["A", "B", "C"]));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_waits_for_new_group_to_propagate(world: TestWorld) {
        world
            .directory
            .fail_next("get_group", Failure::not_found(), 2);

        world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, BIOLOGY)
            .await
            .unwrap();

        assert_eq!(world.directory.calls_to("get_group"), 3);
        assert_eq!(world.directory.owners("g-bio"), set(&["A", "B"]));
    }

    #[tokio::test]
    async fn test_unmapped_group_is_skipped() {
        let world = create_test_world();
        let err = world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, CHEMISTRY)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Skipped(SkipReason::NoMapping(_))));
        assert!(world.directory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_team_without_owner_is_skipped() {
        let world = create_test_world();
        world.directory.seed_group("g-chem", &[], &[]);
        map_group(&world, ObjectSubtype::CourseTeam, CHEMISTRY, "g-chem");

        let err = world
            .service
            .groups
            .reconcile(ObjectSubtype::CourseTeam, CHEMISTRY)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Skipped(SkipReason::NoOwner(_))));
        assert!(world.directory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_user_group_members_come_from_local_group() {
        let world = create_test_world();
        world.directory.seed_group("g-lab", &[], &[]);
        map_group(&world, ObjectSubtype::UserGroup, 7, "g-lab");

        world
            .service
            .groups
            .reconcile(ObjectSubtype::UserGroup, 7)
            .await
            .unwrap();

        assert_eq!(world.directory.owners("g-lab"), set(&["A", "B"]));
        assert_eq!(world.directory.members("g-lab"), set(&["C", "D"]));
    }

    #[tokio::test]
    async fn test_contributor_group_ignores_owners() {
        let world = create_test_world();
        world.directory.seed_group("g-site", &["Z"], &[]);
        map_group(&world, ObjectSubtype::CourseSite, BIOLOGY, "g-site");

        world
            .service
            .groups
            .reconcile(ObjectSubtype::CourseSite, BIOLOGY)
            .await
            .unwrap();

        assert_eq!(world.directory.owners("g-site"), set(&["Z"]));
        assert_eq!(world.directory.members("g-site"), set(&["A", "B"]));
        assert_eq!(world.directory.calls_to("list_group_owners"), 0);
    }

    #[tokio::test]
    async fn test_reconcile_all_counts_skips() {
        let world = create_test_world();
        world.directory.seed_group("g-bio", &["B"], &["B", "D"]);
        world.directory.seed_group("g-chem", &[], &[]);
        map_group(&world, ObjectSubtype::Course, BIOLOGY, "g-bio");
        map_group(&world, ObjectSubtype::CourseTeam, CHEMISTRY, "g-chem");

        let metrics = world.service.groups.reconcile_all().await.unwrap();
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.count(Mutation::MemberAdded), 2);
        assert!(!metrics.has_errors());
    }
}

mod readiness_tests {
    use super::*;

    #[tokio::test]
    async fn test_not_configured_short_circuits() {
        let config = Configuration {
            directory_enabled: false,
            ..create_test_config()
        };
        let world = create_test_world_with(FakeDirectory::new(), config);
        map_group(&world, ObjectSubtype::Course, BIOLOGY, "g-bio");

        let err = world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, BIOLOGY)
            .await
            .unwrap_err();
        assert_eq!(err.skip_reason(), Some(&SkipReason::NotConfigured));
        assert!(world.directory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credentials_short_circuit() {
        let world = create_test_world_with(FakeDirectory::with_credentials(false), create_test_config());
        map_group(&world, ObjectSubtype::Course, BIOLOGY, "g-bio");

        let err = world
            .service
            .groups
            .reconcile(ObjectSubtype::Course, BIOLOGY)
            .await
            .unwrap_err();
        assert!(matches!(err.skip_reason(), Some(SkipReason::NoCredentials(_))));
        assert!(world.directory.calls().is_empty());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_group_creates_once() {
        let world = create_test_world();
        let groups = &world.service.groups;
        let key = MappingKey::group(ObjectSubtype::Course, BIOLOGY);

        let created = groups.ensure_group(key, None).await.unwrap();
        assert_eq!(created.display_name.as_deref(), Some("Biology"));
        assert_eq!(world.store.active_mapping(&key), Some(created.clone()));

        let again = groups.ensure_group(key, None).await.unwrap();
        assert_eq!(again.remote_id, created.remote_id);
        assert_eq!(world.directory.calls_to("create_group"), 1);
    }

    #[tokio::test]
    async fn test_team_is_created_with_owners() {
        let world = create_test_world();
        let mapping = world
            .service
            .groups
            .ensure_group(MappingKey::group(ObjectSubtype::CourseTeam, BIOLOGY), None)
            .await
            .unwrap();

        assert_eq!(world.directory.owners(&mapping.remote_id), set(&["A", "B"]));
    }

    #[tokio::test]
    async fn test_deleted_group_is_restored_from_recycle_bin() {
        let world = create_test_world();
        let groups = &world.service.groups;
        let key = MappingKey::group(ObjectSubtype::Course, BIOLOGY);
        let created = groups.ensure_group(key, None).await.unwrap();

        groups.delete_group(key).await.unwrap();
        assert!(world.store.active_mapping(&key).is_none());
        assert!(world.store.soft_deleted_mapping(&key).is_some());

        let restored = groups.ensure_group(key, None).await.unwrap();
        assert_eq!(restored.remote_id, created.remote_id);
        assert!(!restored.is_soft_deleted());
        assert_eq!(world.directory.calls_to("restore_group"), 1);
        assert_eq!(world.directory.calls_to("create_group"), 1);
    }

    #[tokio::test]
    async fn test_purged_group_is_recreated() {
        let world = create_test_world();
        let groups = &world.service.groups;
        let key = MappingKey::group(ObjectSubtype::Course, BIOLOGY);
        let created = groups.ensure_group(key, None).await.unwrap();
        groups.delete_group(key).await.unwrap();
        world.directory.state.lock().deleted_groups.clear();

        let soft_deleted = world.store.soft_deleted_mapping(&key).unwrap();
        assert_eq!(
            groups.resolve_soft_deleted(soft_deleted).await.unwrap(),
            GroupResolution::Purged
        );
        assert!(world.store.soft_deleted_mapping(&key).is_none());

        let recreated = groups.ensure_group(key, None).await.unwrap();
        assert_ne!(recreated.remote_id, created.remote_id);
    }

    #[tokio::test]
    async fn test_provision_creates_every_missing_group() {
        let world = create_test_world();
        let groups = &world.service.groups;

        let metrics = groups.provision_missing().await.unwrap();

        // Chemistry has no teacher, so its team waits for an owner
        assert_eq!(metrics.count(Mutation::GroupCreated), 6);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(world.directory.calls_to("create_group"), 6);
        for key in [
            MappingKey::group(ObjectSubtype::Course, BIOLOGY),
            MappingKey::group(ObjectSubtype::CourseTeam, BIOLOGY),
            MappingKey::group(ObjectSubtype::CourseSite, BIOLOGY),
            MappingKey::group(ObjectSubtype::UserGroup, 7),
            MappingKey::group(ObjectSubtype::Course, CHEMISTRY),
            MappingKey::group(ObjectSubtype::CourseSite, CHEMISTRY),
        ] {
            assert!(world.store.active_mapping(&key).is_some(), "{} is mapped", key);
        }
        assert!(world
            .store
            .active_mapping(&MappingKey::group(ObjectSubtype::CourseTeam, CHEMISTRY))
            .is_none());

        let again = groups.provision_missing().await.unwrap();
        assert_eq!(again.count(Mutation::GroupCreated), 0);
        assert_eq!(world.directory.calls_to("create_group"), 6);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_remote_group() {
        let world = create_test_world();
        map_group(&world, ObjectSubtype::Course, BIOLOGY, "g-gone");

        let key = MappingKey::group(ObjectSubtype::Course, BIOLOGY);
        world.service.groups.delete_group(key).await.unwrap();
        assert!(world.store.soft_deleted_mapping(&key).unwrap().is_soft_deleted());
    }
}

mod course_reset_tests {
    use super::*;

    fn world_with(action: CourseResetAction) -> TestWorld {
        let config = Configuration {
            course_reset_action: action,
            ..create_test_config()
        };
        let world = create_test_world_with(FakeDirectory::new(), config);
        world.directory.seed_group("g-bio", &["A"], &["A"]);
        world.directory.seed_group("g-lab", &[], &[]);
        map_group(&world, ObjectSubtype::Course, BIOLOGY, "g-bio");
        map_group(&world, ObjectSubtype::UserGroup, 7, "g-lab");
        world
    }

    #[tokio::test]
    async fn test_disconnect_leaves_remote_groups() {
        let world = world_with(CourseResetAction::Disconnect);

        let outcome = world.service.groups.handle_course_reset(BIOLOGY).await.unwrap();

        assert_eq!(outcome.disconnected.len(), 2);
        assert!(outcome.recreated.is_empty());
        assert!(world.directory.calls().is_empty());
        let mapping = world
            .store
            .soft_deleted_mapping(&MappingKey::group(ObjectSubtype::Course, BIOLOGY))
            .unwrap();
        assert!(mapping.is_disconnected());
    }

    #[tokio::test]
    async fn test_disconnect_and_recreate_provisions_fresh_groups() {
        let world = world_with(CourseResetAction::DisconnectAndRecreate);

        let outcome = world.service.groups.handle_course_reset(BIOLOGY).await.unwrap();

        assert_eq!(outcome.recreated.len(), 2);
        assert_eq!(world.directory.calls_to("is_group_in_deleted_items"), 0);
        assert_eq!(world.directory.calls_to("create_group"), 2);
        let active = world
            .store
            .active_mapping(&MappingKey::group(ObjectSubtype::Course, BIOLOGY))
            .unwrap();
        assert_ne!(active.remote_id, "g-bio");
        assert!(world.directory.state.lock().groups.contains_key("g-bio"));
    }

    #[tokio::test]
    async fn test_course_override_wins() {
        let world = world_with(CourseResetAction::DisconnectAndRecreate);
        world.store.update_local(|local| {
            local.courses[0].reset_action = Some(CourseResetAction::Nothing);
        });
        assert_eq!(
            world.store.course_reset_override(BIOLOGY),
            Some(CourseResetAction::Nothing)
        );

        let outcome = world.service.groups.handle_course_reset(BIOLOGY).await.unwrap();

        assert_eq!(outcome.action, CourseResetAction::Nothing);
        assert!(outcome.disconnected.is_empty());
        assert!(world
            .store
            .active_mapping(&MappingKey::group(ObjectSubtype::Course, BIOLOGY))
            .is_some());
    }
}
