//! Integration tests for the provisioning state machine.

mod support;

use chrono::{Duration, Utc};
use uuid::Uuid;

use steward::domain::{
    FulfillmentState, Plan, ProvisioningState, ProvisioningType, Subscription, SubscriptionId,
};
use steward::error::ProvisioningError;
use steward::port::{OperationStatus, SubscriptionStore};

use support::TestEnv;

const TEMPLATE: &str = r#"{
    "parameters": {
        "resourceGroupLocation": { "type": "string" },
        "vnetRange": { "type": "string" }
    },
    "resources": []
}"#;

/// Offer/plan with a subscribe template, a webhook and the parameters the
/// template needs.
fn seed_full_offer(env: &TestEnv) -> (steward::domain::OfferName, steward::domain::PlanName) {
    let (offer, plan) = env.seed_offer();
    env.set_plan(Plan {
        subscribe_template: Some("main".into()),
        subscribe_webhook: Some(
            "https://hooks.contoso.example/notify?range={vnetRange}&src=steward".into(),
        ),
        ..Plan::bare(offer.clone(), plan.clone())
    });
    env.catalog.add_template(offer.clone(), "main", TEMPLATE);
    env.catalog
        .add_parameter(offer.clone(), "resourceGroupLocation", "\"westus2\"");
    env.catalog
        .add_parameter(offer.clone(), "vnetRange", "\"10.0.0.0/28\"");
    env.catalog.add_parameter(
        offer.clone(),
        "entryPointUrl",
        "\"https://app.contoso.example\"",
    );
    (offer, plan)
}

#[tokio::test]
async fn subscribe_flow_walks_the_full_state_machine() {
    let env = TestEnv::new();
    let (offer, plan) = seed_full_offer(&env);
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ProvisioningPending,
            FulfillmentState::PendingFulfillmentStart,
        )
        .await;
    let orchestrator = env.orchestrator();

    // ProvisioningPending -> DeployResourceGroupRunning
    orchestrator.advance(id).await.unwrap();
    let subscription = env.subscription(id).await;
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::DeployResourceGroupRunning
    );
    assert_eq!(
        subscription.entry_point_url.as_deref(),
        Some("https://app.contoso.example")
    );
    let created = env.provisioning.created_groups.lock().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, format!("contoso-{id}"));
    assert_eq!(created[0].1, "westus2");

    // Group not visible yet: stays put.
    orchestrator.advance(id).await.unwrap();
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::DeployResourceGroupRunning
    );

    // Group appears -> ArmTemplatePending
    env.provisioning.rg_exists.lock().push(true);
    orchestrator.advance(id).await.unwrap();
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::ArmTemplatePending
    );

    // Deploy -> ArmTemplateRunning, with resolved parameter values.
    orchestrator.advance(id).await.unwrap();
    let subscription = env.subscription(id).await;
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::ArmTemplateRunning
    );
    assert!(subscription.deployment_name.is_some());
    let deployments = env.provisioning.deployments.lock().clone();
    assert_eq!(deployments.len(), 1);
    assert_eq!(
        deployments[0].1["vnetRange"]["value"],
        serde_json::json!("10.0.0.0/28")
    );

    // Still running -> stays; then succeeded -> WebhookPending.
    env.provisioning
        .deployment_statuses
        .lock()
        .push(steward::port::DeploymentStatus::Running);
    orchestrator.advance(id).await.unwrap();
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::ArmTemplateRunning
    );
    orchestrator.advance(id).await.unwrap();
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::WebhookPending
    );

    // Webhook fires with the placeholder substituted.
    orchestrator.advance(id).await.unwrap();
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::NotificationPending
    );
    let webhooks = env.provisioning.webhooks.lock().clone();
    assert_eq!(webhooks.len(), 1);
    let pairs: Vec<(String, String)> = webhooks[0]
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert!(pairs.contains(&("range".to_string(), "10.0.0.0/28".to_string())));
    assert!(pairs.contains(&("src".to_string(), "steward".to_string())));

    // Activation settles the subscription.
    orchestrator.advance(id).await.unwrap();
    let subscription = env.subscription(id).await;
    assert_eq!(subscription.provisioning_state, ProvisioningState::Succeeded);
    assert_eq!(subscription.status, FulfillmentState::Subscribed);
    assert!(subscription.activated_time.is_some());
    let activations = env.fulfillment.activations.lock();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].1.quantity, 1);
}

#[tokio::test]
async fn plan_without_template_skips_to_webhook() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    env.catalog
        .add_parameter(offer.clone(), "resourceGroupLocation", "\"westus2\"");
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ProvisioningPending,
            FulfillmentState::PendingFulfillmentStart,
        )
        .await;

    env.orchestrator().advance(id).await.unwrap();

    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::WebhookPending
    );
    assert!(env.provisioning.created_groups.lock().is_empty());
}

#[tokio::test]
async fn webhook_operation_is_rejected_while_provisioning_is_in_flight() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let busy = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ArmTemplatePending,
            FulfillmentState::Subscribed,
        )
        .await;
    let settled = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Subscribed,
        )
        .await;
    let orchestrator = env.orchestrator();

    let err = orchestrator.suspend(busy, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::OperationInFlight { .. }));
    assert_eq!(
        env.subscription(busy).await.provisioning_state,
        ProvisioningState::ArmTemplatePending
    );

    let operation_id = Uuid::new_v4();
    orchestrator.suspend(settled, operation_id).await.unwrap();
    let subscription = env.subscription(settled).await;
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::ArmTemplatePending
    );
    assert_eq!(subscription.provisioning_type, ProvisioningType::Suspend);
    assert_eq!(subscription.operation_id, Some(operation_id));
}

#[tokio::test]
async fn batch_continues_after_one_subscription_fails() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    env.catalog
        .add_parameter(offer.clone(), "resourceGroupLocation", "\"westus2\"");
    env.set_plan(Plan {
        subscribe_template: Some("main".into()),
        ..Plan::bare(offer.clone(), plan.clone())
    });
    env.catalog.add_template(offer.clone(), "main", TEMPLATE);
    env.catalog
        .add_parameter(offer.clone(), "vnetRange", "\"10.0.0.0/28\"");

    // Fixed ids so the driver's processing order is deterministic.
    let first = SubscriptionId::new(Uuid::from_u128(1));
    let second = SubscriptionId::new(Uuid::from_u128(2));
    for id in [first, second] {
        let sub = Subscription::new(
            id,
            offer.clone(),
            plan.clone(),
            "owner@contoso.example",
            1,
            Utc::now(),
        );
        env.subscriptions.create(&sub).await.unwrap();
    }

    // Only the first create call fails.
    env.provisioning
        .fail_once("create_resource_group", "throttled", true);

    let processed = env
        .orchestrator()
        .process_active_provisions()
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let failed = env.subscription(first).await;
    assert_eq!(
        failed.provisioning_state,
        ProvisioningState::ProvisioningPending,
        "transient failure retries in place"
    );
    assert_eq!(failed.retry_count, 1);
    assert!(failed.last_exception.as_deref().unwrap().contains("throttled"));

    let advanced = env.subscription(second).await;
    assert_eq!(
        advanced.provisioning_state,
        ProvisioningState::DeployResourceGroupRunning
    );
}

#[tokio::test]
async fn transient_failures_exhaust_into_failed() {
    let env = TestEnv::new();
    let (offer, plan) = seed_full_offer(&env);
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ProvisioningPending,
            FulfillmentState::PendingFulfillmentStart,
        )
        .await;
    env.provisioning
        .fail_always("create_resource_group", "gateway timeout", true);
    let orchestrator = env.orchestrator();

    for expected_retry in 1..=3u32 {
        orchestrator.advance(id).await.unwrap_err();
        let subscription = env.subscription(id).await;
        assert_eq!(
            subscription.provisioning_state,
            ProvisioningState::ProvisioningPending
        );
        assert_eq!(subscription.retry_count, expected_retry);
    }

    // Retry budget spent: the next failure is terminal.
    orchestrator.advance(id).await.unwrap_err();
    let subscription = env.subscription(id).await;
    assert_eq!(subscription.provisioning_state, ProvisioningState::Failed);
    assert_eq!(subscription.retry_count, 0);
    assert!(subscription
        .last_exception
        .as_deref()
        .unwrap()
        .contains("gateway timeout"));
}

#[tokio::test]
async fn missing_location_parameter_is_fatal() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    env.set_plan(Plan {
        subscribe_template: Some("main".into()),
        ..Plan::bare(offer.clone(), plan.clone())
    });
    env.catalog.add_template(offer.clone(), "main", TEMPLATE);
    // No resourceGroupLocation declared.
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ProvisioningPending,
            FulfillmentState::PendingFulfillmentStart,
        )
        .await;

    let err = env.orchestrator().advance(id).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::MissingParameter { .. }));
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::Failed
    );
}

#[tokio::test]
async fn template_without_parameters_object_is_fatal() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    env.set_plan(Plan {
        subscribe_template: Some("main".into()),
        ..Plan::bare(offer.clone(), plan.clone())
    });
    env.catalog
        .add_template(offer.clone(), "main", r#"{"resources": []}"#);
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ArmTemplatePending,
            FulfillmentState::PendingFulfillmentStart,
        )
        .await;

    // Resource group already recorded so the step reaches the template.
    let mut subscription = env.subscription(id).await;
    subscription.resource_group = Some("contoso-rg".into());
    env.subscriptions.update(&subscription).await.unwrap();

    let err = env.orchestrator().advance(id).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::TemplateParameters));
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::Failed
    );
}

#[tokio::test]
async fn step_rejects_wrong_input_state() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::ProvisioningPending,
            FulfillmentState::PendingFulfillmentStart,
        )
        .await;

    let err = env.orchestrator().deploy_template(id).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::WrongState { .. }));
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::ProvisioningPending,
        "a rejected step must not move the subscription"
    );
}

#[tokio::test]
async fn unsubscribe_runs_to_completion_and_stamps_usage() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Subscribed,
        )
        .await;
    let meter = env.seed_meter(&offer, &plan).await;
    env.seed_usage(id, &meter, Utc::now()).await;
    let mut subscription = env.subscription(id).await;
    subscription.resource_group = Some(format!("contoso-{id}"));
    env.subscriptions.update(&subscription).await.unwrap();
    let orchestrator = env.orchestrator();

    let operation_id = Uuid::new_v4();
    orchestrator.unsubscribe(id, operation_id).await.unwrap();
    let subscription = env.subscription(id).await;
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::ArmTemplatePending
    );
    assert_eq!(subscription.provisioning_type, ProvisioningType::Unsubscribe);
    assert!(env.usage_record(id, &meter).await.unsubscribed_time.is_some());

    // No teardown template or webhook configured: the flow skips through.
    orchestrator.advance(id).await.unwrap();
    orchestrator.advance(id).await.unwrap();
    orchestrator.advance(id).await.unwrap();

    let subscription = env.subscription(id).await;
    assert_eq!(subscription.provisioning_state, ProvisioningState::Succeeded);
    assert_eq!(subscription.status, FulfillmentState::Unsubscribed);
    assert!(subscription.unsubscribed_time.is_some());

    let updates = env.fulfillment.operation_updates.lock();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, operation_id);
    assert_eq!(updates[0].2.status, OperationStatus::Success);
}

#[tokio::test]
async fn unsubscribed_past_retention_enters_data_deletion() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Unsubscribed,
        )
        .await;
    let mut subscription = env.subscription(id).await;
    subscription.unsubscribed_time = Some(Utc::now() - Duration::days(1));
    env.subscriptions.update(&subscription).await.unwrap();

    env.orchestrator().process_active_provisions().await.unwrap();

    let subscription = env.subscription(id).await;
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::ArmTemplatePending
    );
    assert_eq!(subscription.provisioning_type, ProvisioningType::DeleteData);
}

#[tokio::test]
async fn unsubscribed_within_retention_is_left_alone() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    env.set_plan(Plan {
        data_retention_days: 30,
        ..Plan::bare(offer.clone(), plan.clone())
    });
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Unsubscribed,
        )
        .await;
    let mut subscription = env.subscription(id).await;
    subscription.unsubscribed_time = Some(Utc::now() - Duration::days(1));
    env.subscriptions.update(&subscription).await.unwrap();

    let orchestrator = env.orchestrator();
    let provisions = orchestrator.in_progress_provisions().await.unwrap();
    assert!(provisions.is_empty());

    orchestrator.process_active_provisions().await.unwrap();
    assert_eq!(
        env.subscription(id).await.provisioning_state,
        ProvisioningState::Succeeded
    );
}

#[tokio::test]
async fn quantity_change_updates_in_place() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Subscribed,
        )
        .await;

    env.orchestrator()
        .change_quantity(id, 7, Uuid::new_v4())
        .await
        .unwrap();

    let subscription = env.subscription(id).await;
    assert_eq!(subscription.quantity, 7);
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::Succeeded,
        "quantity changes don't re-provision"
    );
}

#[tokio::test]
async fn plan_change_validates_the_target_plan() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let id = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Subscribed,
        )
        .await;
    let orchestrator = env.orchestrator();

    let err = orchestrator
        .change_plan(id, "premium".into(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Store(_)));

    env.set_plan(Plan::bare(offer.clone(), "premium".into()));
    orchestrator
        .change_plan(id, "premium".into(), Uuid::new_v4())
        .await
        .unwrap();

    let subscription = env.subscription(id).await;
    assert_eq!(subscription.plan.as_str(), "premium");
    assert_eq!(subscription.provisioning_type, ProvisioningType::Update);
    assert_eq!(
        subscription.provisioning_state,
        ProvisioningState::ArmTemplatePending
    );
}

#[tokio::test]
async fn reinstate_requires_a_suspended_subscription() {
    let env = TestEnv::new();
    let (offer, plan) = env.seed_offer();
    let active = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Subscribed,
        )
        .await;
    let suspended = env
        .seed_subscription(
            &offer,
            &plan,
            ProvisioningState::Succeeded,
            FulfillmentState::Suspended,
        )
        .await;
    let orchestrator = env.orchestrator();

    let err = orchestrator
        .reinstate(active, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::OperationInFlight { .. }));

    orchestrator.reinstate(suspended, Uuid::new_v4()).await.unwrap();
    assert_eq!(
        env.subscription(suspended).await.provisioning_type,
        ProvisioningType::Reinstate
    );
}
