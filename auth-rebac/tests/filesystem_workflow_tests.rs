//! Virtual-filesystem workflow tests.
//!
//! These tests simulate real multi-tenant filesystem scenarios:
//! 1. Team workspace: group access, onboarding and offboarding
//! 2. Cross-tenant collaboration via shared-* relations
//! 3. Contractor with expiring, time-windowed access
//! 4. Directory listing filtered through the bulk checker

use auth_rebac::*;
use chrono::{Duration, Utc};
use std::sync::Arc;

fn create_test_engine() -> AuthorizationEngine {
    AuthorizationEngine::new(Arc::new(MemoryTupleStore::new()))
}

// ============================================================================
// TEST 1: Team workspace with onboarding and offboarding
// ============================================================================

#[tokio::test]
async fn test_team_workspace_lifecycle() {
    println!("\n📁 TEST 1: Team workspace lifecycle");

    let engine = create_test_engine();
    let zone = "org_acme";
    let workspace = Entity::file("/teams/platform");

    // The platform group can edit its workspace tree.
    engine
        .write(TupleWrite::new(
            TupleSubject::userset(Entity::group("platform"), "member"),
            "direct_editor",
            workspace.clone(),
            zone,
        ))
        .await
        .unwrap();

    // Day 1: alice is on the team, bob is not.
    engine
        .write(TupleWrite::new(
            Entity::user("alice"),
            "member",
            Entity::group("platform"),
            zone,
        ))
        .await
        .unwrap();

    let deep_file = Entity::file("/teams/platform/services/api/main.rs");
    assert!(engine
        .check(&Entity::user("alice"), "write", &deep_file, zone)
        .await
        .unwrap());
    assert!(!engine
        .check(&Entity::user("bob"), "write", &deep_file, zone)
        .await
        .unwrap());

    // Onboarding: bob joins and gains access through the group.
    println!("  ✓ Onboarding bob into the platform group");
    let membership = engine
        .write(TupleWrite::new(
            Entity::user("bob"),
            "member",
            Entity::group("platform"),
            zone,
        ))
        .await
        .unwrap();
    assert!(engine
        .check(&Entity::user("bob"), "write", &deep_file, zone)
        .await
        .unwrap());

    // Offboarding: deleting the membership revokes everything at once,
    // including warm cache entries.
    println!("  ✓ Offboarding bob");
    assert!(engine.delete(membership).await.unwrap());
    assert!(!engine
        .check(&Entity::user("bob"), "write", &deep_file, zone)
        .await
        .unwrap());
    assert!(engine
        .check(&Entity::user("alice"), "write", &deep_file, zone)
        .await
        .unwrap());
}

// ============================================================================
// TEST 2: Cross-tenant collaboration
// ============================================================================

#[tokio::test]
async fn test_cross_tenant_collaboration() {
    println!("\n🤝 TEST 2: Cross-tenant collaboration");

    let engine = create_test_engine();
    let design_doc = Entity::file("/contracts/design.md");
    let consultant = Entity::user("carla@partner");

    // The consultant lives in org_partner; the document in org_acme. Only
    // the shared-* family may bridge them.
    engine
        .write(
            TupleWrite::new(consultant.clone(), "shared-editor", design_doc.clone(), "org_acme")
                .between_zones("org_partner", "org_acme"),
        )
        .await
        .unwrap();

    assert!(engine
        .check(&consultant, "write", &design_doc, "org_acme")
        .await
        .unwrap());
    assert!(engine
        .check(&consultant, "read", &design_doc, "org_acme")
        .await
        .unwrap());
    // shared-editor does not confer ownership.
    assert!(!engine
        .check(&consultant, "manage", &design_doc, "org_acme")
        .await
        .unwrap());

    // Collaboration ends: the share is revoked.
    println!("  ✓ Revoking the share");
    let shares = engine
        .read_tuples(&TupleFilter {
            subject: Some(consultant.clone()),
            relation: Some("shared-editor".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(shares.len(), 1);
    engine.delete(shares[0].tuple_id).await.unwrap();

    assert!(!engine
        .check(&consultant, "write", &design_doc, "org_acme")
        .await
        .unwrap());
}

// ============================================================================
// TEST 3: Contractor with expiring, time-windowed access
// ============================================================================

#[tokio::test]
async fn test_contractor_scoped_access() {
    println!("\n⏱ TEST 3: Contractor with bounded access");

    let engine = create_test_engine();
    let zone = "org_acme";
    let contractor = Entity::user("contractor_lee");
    let audit_dir = Entity::file("/finance/audit-2026");

    // Readable only during business hours, and the whole grant expires in
    // thirty days.
    engine
        .write(
            TupleWrite::new(contractor.clone(), "direct_viewer", audit_dir.clone(), zone)
                .with_expiry(Utc::now() + Duration::days(30))
                .with_conditions(TupleConditions {
                    time_window: Some(TimeWindow {
                        start: "09:00".to_string(),
                        end: "17:00".to_string(),
                    }),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();

    let business_hours = AccessContext::at_time("10:30");
    assert!(engine
        .check_with_context(&contractor, "read", &audit_dir, zone, Some(&business_hours), None)
        .await
        .unwrap());

    let midnight = AccessContext::at_time("00:30");
    assert!(!engine
        .check_with_context(&contractor, "read", &audit_dir, zone, Some(&midnight), None)
        .await
        .unwrap());

    // Inherited access obeys the same conditions.
    let nested = Entity::file("/finance/audit-2026/q3/ledger.xlsx");
    assert!(engine
        .check_with_context(&contractor, "read", &nested, zone, Some(&business_hours), None)
        .await
        .unwrap());
    assert!(!engine
        .check_with_context(&contractor, "read", &nested, zone, Some(&midnight), None)
        .await
        .unwrap());
}

// ============================================================================
// TEST 4: Directory listing through the bulk checker
// ============================================================================

#[tokio::test]
async fn test_directory_listing_filter() {
    println!("\n📂 TEST 4: Directory listing filter");

    let engine = create_test_engine();
    let zone = "org_acme";
    let reader = Entity::user("dana");

    // dana can read /reports; /private is off limits except one shared file.
    engine
        .write(TupleWrite::new(
            reader.clone(),
            "direct_viewer",
            Entity::file("/reports"),
            zone,
        ))
        .await
        .unwrap();
    engine
        .write(TupleWrite::new(
            reader.clone(),
            "direct_viewer",
            Entity::file("/private/for-dana.txt"),
            zone,
        ))
        .await
        .unwrap();

    let mut listing = Vec::new();
    for i in 0..50 {
        listing.push(CheckItem::new(
            reader.clone(),
            "read",
            Entity::file(&format!("/reports/weekly-{i}.md")),
        ));
        listing.push(CheckItem::new(
            reader.clone(),
            "read",
            Entity::file(&format!("/private/secret-{i}.md")),
        ));
    }
    listing.push(CheckItem::new(
        reader.clone(),
        "read",
        Entity::file("/private/for-dana.txt"),
    ));

    let decisions = engine.check_bulk(&listing, zone, None).await.unwrap();

    let visible: Vec<_> = listing
        .iter()
        .filter(|check| decisions[*check])
        .map(|check| check.object.entity_id.as_str())
        .collect();

    assert_eq!(visible.len(), 51, "50 reports + the one shared private file");
    assert!(visible.contains(&"/private/for-dana.txt"));
    assert!(!visible.iter().any(|path| path.starts_with("/private/secret")));

    // The same listing again is answered from the caches.
    let stats_before = engine.cache_stats().unwrap();
    let repeat = engine.check_bulk(&listing, zone, None).await.unwrap();
    let stats_after = engine.cache_stats().unwrap();

    assert_eq!(repeat, decisions);
    assert!(
        stats_after.hits > stats_before.hits,
        "second listing should hit the L1 cache"
    );
}
