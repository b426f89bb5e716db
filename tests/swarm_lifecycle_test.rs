//! Swarm 生命周期集成测试：生成、终止、墓地、回收与关闭

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use hive::config::AppConfig;
    use hive::core::{Event, Kernel, KernelStorage, SwarmError};
    use hive::llm::{BackendSet, MockBackend};
    use hive::swarm::{Delivery, PersistenceMode, SpawnRequest, SwarmSweeper, SweepPolicy};

    async fn kernel() -> Arc<Kernel> {
        let mut config = AppConfig::default();
        config.router.default_chain = vec!["mock".into()];
        config.swarm.run_mission_on_spawn = false;
        config.swarm.stop_grace_secs = 1;
        let backends = BackendSet::new().with("mock", Arc::new(MockBackend::new()));
        Kernel::boot_with(config, backends, KernelStorage::in_memory().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_terminated_agent_lands_in_graveyard() {
        let kernel = kernel().await;
        let swarm = kernel.swarm();
        let mut events = kernel.bus().subscribe();

        let spawned = swarm
            .spawn(SpawnRequest::child_of(kernel.root(), "scout", "explore the docs"))
            .await
            .unwrap();
        assert!(spawned.created);
        assert_eq!(spawned.record.tier, 2);
        assert!(swarm.runtimes().contains(&spawned.record.id).await);

        assert!(swarm.terminate(&spawned.record.id, "requested").await.unwrap());
        assert!(!swarm.runtimes().contains(&spawned.record.id).await);

        let graveyard = swarm.graveyard().unwrap();
        assert_eq!(graveyard.len(), 1);
        assert_eq!(graveyard[0].termination_reason.as_deref(), Some("requested"));
        assert!(graveyard[0].terminated_at.is_some());
        assert!(swarm.list_active().unwrap().iter().all(|r| r.id != spawned.record.id));

        let mut seen = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            match envelope.event {
                Event::AgentSpawned { .. } => seen.push("spawned"),
                Event::AgentTerminated { .. } => seen.push("terminated"),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["spawned", "terminated"]);

        let entries = kernel.logbook().recent(20).await.unwrap();
        assert!(entries.iter().any(|e| e.event == "birth" && e.agent_name.as_deref() == Some("scout")));
        assert!(entries.iter().any(|e| e.event == "termination"));
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_only_idle_ephemeral_agents() {
        let kernel = kernel().await;
        let swarm = kernel.swarm();
        let root = kernel.root().clone();

        let stale = swarm
            .spawn(SpawnRequest::child_of(&root, "stale", "wait"))
            .await
            .unwrap()
            .record;
        let fresh = swarm
            .spawn(SpawnRequest::child_of(&root, "fresh", "wait"))
            .await
            .unwrap()
            .record;
        let keeper = swarm
            .spawn(
                SpawnRequest::child_of(&root, "keeper", "wait").with_persistence(PersistenceMode::Persistent),
            )
            .await
            .unwrap()
            .record;

        let eleven_minutes_ago = Utc::now() - chrono::Duration::minutes(11);
        swarm.registry().touch_at(&stale.id, eleven_minutes_ago).unwrap();
        swarm.registry().touch_at(&keeper.id, eleven_minutes_ago).unwrap();
        swarm.registry().touch_at(&root.id, eleven_minutes_ago).unwrap();

        let sweeper = SwarmSweeper::new(
            Arc::clone(swarm),
            Duration::from_secs(60),
            Duration::from_secs(600),
            SweepPolicy::IdleOnly,
        );
        let reclaimed = sweeper.sweep_once().await.unwrap();
        assert_eq!(reclaimed, vec![stale.id.clone()]);

        let graveyard = swarm.graveyard().unwrap();
        assert_eq!(graveyard[0].termination_reason.as_deref(), Some("timeout"));
        let active: Vec<String> = swarm.list_active().unwrap().into_iter().map(|r| r.id).collect();
        assert!(active.contains(&fresh.id));
        assert!(active.contains(&keeper.id));
        assert!(active.contains(&root.id));

        // 第二次回收没有新目标
        assert!(sweeper.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_messages_to_terminated_agents_are_rejected() {
        let kernel = kernel().await;
        let swarm = kernel.swarm();
        let root = kernel.root().clone();
        let worker = swarm
            .spawn(SpawnRequest::child_of(&root, "worker", "wait"))
            .await
            .unwrap()
            .record;

        let delivery = swarm.send_message(&root.id, &worker.id, "status?").await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);

        swarm.terminate(&worker.id, "requested").await.unwrap();
        let err = swarm.send_message(&root.id, &worker.id, "still there?").await.unwrap_err();
        assert!(matches!(err, SwarmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_runtimes_but_keeps_records() {
        let kernel = kernel().await;
        let swarm = kernel.swarm();
        let worker = swarm
            .spawn(SpawnRequest::child_of(kernel.root(), "worker", "wait"))
            .await
            .unwrap()
            .record;

        kernel.shutdown().await;
        assert_eq!(swarm.runtimes().len().await, 0);
        assert!(!swarm.is_accepting());
        assert!(swarm.list_active().unwrap().iter().any(|r| r.id == worker.id));

        let err = swarm
            .spawn(SpawnRequest::child_of(kernel.root(), "late", "too late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::ShuttingDown));

        // 幂等
        kernel.shutdown().await;
    }
}
