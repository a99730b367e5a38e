use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use wayfare_api::metrics::Metrics;
use wayfare_api::protocol::{expect_bool, expect_int, expect_text, Request};
use wayfare_api::remote::{Channel, RemoteResourceManager};
use wayfare_api::server::serve;
use wayfare_api::{app, client, AppState, Coordinator};
use wayfare_catalog::InventoryManager;
use wayfare_core::{CoreError, CoreResult, Participant, ResourceManager};
use wayfare_shared::{ResourceKind, TxnId};
use wayfare_store::app_config::ItineraryMode;
use wayfare_store::FileJournal;
use wayfare_txn::{TransactionManager, TxnSettings};

struct RmNode {
    rm: Arc<InventoryManager>,
    server: JoinHandle<std::io::Result<()>>,
}

struct Cluster {
    addr: String,
    coordinator: Arc<Coordinator>,
    nodes: HashMap<ResourceKind, RmNode>,
    _dir: tempfile::TempDir,
}

impl Cluster {
    async fn start(mode: ItineraryMode) -> Self {
        let mut nodes = HashMap::new();
        let mut rms: HashMap<ResourceKind, Arc<dyn ResourceManager>> = HashMap::new();
        let mut participants: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();

        for kind in ResourceKind::ALL {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let rm = Arc::new(InventoryManager::new(kind.as_str(), kind));
            let server = tokio::spawn(serve(listener, rm.clone(), rm.shutdown_signal()));
            nodes.insert(kind, RmNode { rm, server });

            let remote = Arc::new(
                RemoteResourceManager::connect(kind, &addr, 3, Duration::from_millis(50))
                    .await
                    .unwrap(),
            );
            rms.insert(kind, remote.clone());
            participants.insert(kind, remote);
        }

        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(FileJournal::new(dir.path().join("tm_journal.json")));
        let tm = TransactionManager::open(participants, journal, TxnSettings::default())
            .await
            .unwrap();
        let coordinator = Arc::new(
            Coordinator::new(rms, Arc::new(tm), mode, Arc::new(Metrics::new().unwrap())).unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, coordinator.clone(), coordinator.shutdown_signal()));

        Self {
            addr,
            coordinator,
            nodes,
            _dir: dir,
        }
    }

    fn rm(&self, kind: ResourceKind) -> &InventoryManager {
        &self.nodes[&kind].rm
    }

    /// Stops one RM server and waits until its connections are closed.
    async fn kill(&mut self, kind: ResourceKind) {
        let node = self.nodes.get_mut(&kind).unwrap();
        node.rm.shutdown().await.unwrap();
        (&mut node.server).await.unwrap().unwrap();
    }

    async fn channel(&self) -> Channel {
        Channel::connect(&self.addr).await.unwrap()
    }
}

async fn send(channel: &mut Channel, line: &str) -> CoreResult<Option<String>> {
    channel.call(&Request::parse(line).unwrap()).await
}

#[tokio::test]
async fn test_booking_over_the_wire() {
    let cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let mut ch = cluster.channel().await;

    let txn = expect_int(send(&mut ch, "start").await.unwrap()).unwrap();
    assert!(expect_bool(send(&mut ch, &format!("addFlight,{},100,5,300", txn)).await.unwrap()).unwrap());
    assert!(expect_bool(send(&mut ch, &format!("addCars,{},Paris,2,80", txn)).await.unwrap()).unwrap());
    let customer = expect_int(send(&mut ch, &format!("newCustomer,{}", txn)).await.unwrap()).unwrap();
    assert!(expect_bool(send(&mut ch, &format!("reserveFlight,{},{},100", txn, customer)).await.unwrap()).unwrap());
    assert!(expect_bool(send(&mut ch, &format!("reserveCar,{},{},paris", txn, customer)).await.unwrap()).unwrap());

    // Not visible outside the transaction yet
    assert_eq!(expect_int(send(&mut ch, "queryFlight,-1,100").await.unwrap()).unwrap(), 0);

    let info = expect_text(send(&mut ch, &format!("queryCustomerInfo,{},{}", txn, customer)).await.unwrap()).unwrap();
    assert!(info.contains(&format!("Flight info:\nBill for customer {}\n1 flight-100 $300\n", customer)));
    assert!(info.contains("1 car-paris $80\n"));

    assert!(expect_bool(send(&mut ch, &format!("commit,{}", txn)).await.unwrap()).unwrap());
    assert_eq!(expect_int(send(&mut ch, "queryFlight,-1,100").await.unwrap()).unwrap(), 4);
    assert_eq!(expect_int(send(&mut ch, "queryCarsPrice,-1,paris").await.unwrap()).unwrap(), 80);
    for kind in ResourceKind::ALL {
        assert!(cluster.rm(kind).active_transactions().await.is_empty());
    }

    // Repeated commit reports the earlier outcome
    assert!(expect_bool(send(&mut ch, &format!("commit,{}", txn)).await.unwrap()).unwrap());
    assert!(matches!(
        send(&mut ch, "commit,77").await,
        Err(CoreError::InvalidTransaction(TxnId(77), _))
    ));
}

#[tokio::test]
async fn test_commit_with_unreachable_participant_aborts_everywhere() {
    let mut cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let mut ch = cluster.channel().await;

    let txn = expect_int(send(&mut ch, "start").await.unwrap()).unwrap();
    assert!(expect_bool(send(&mut ch, &format!("addFlight,{},7,10,100", txn)).await.unwrap()).unwrap());
    assert!(expect_bool(send(&mut ch, &format!("addRooms,{},rome,3,90", txn)).await.unwrap()).unwrap());

    cluster.kill(ResourceKind::Room).await;

    let err = send(&mut ch, &format!("commit,{}", txn)).await.unwrap_err();
    assert!(matches!(err, CoreError::TransactionAborted(id, _) if id == TxnId(txn)));

    // The reachable participant discarded its view, nothing was merged
    assert!(cluster.rm(ResourceKind::Flight).active_transactions().await.is_empty());
    assert_eq!(cluster.rm(ResourceKind::Flight).query_flight(TxnId::GLOBAL, 7).await.unwrap(), 0);
    assert_eq!(cluster.rm(ResourceKind::Room).query_rooms(TxnId::GLOBAL, "rome").await.unwrap(), 0);

    // The abort is still owed to the room RM
    let pending = cluster.coordinator.tm().transaction(TxnId(txn)).await.unwrap();
    assert!(pending.undelivered.contains(&ResourceKind::Room));
}

#[tokio::test]
async fn test_transport_failure_aborts_enclosing_transaction() {
    let mut cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let mut ch = cluster.channel().await;

    assert!(expect_bool(send(&mut ch, "addFlight,-1,9,4,50").await.unwrap()).unwrap());
    let txn = expect_int(send(&mut ch, "start").await.unwrap()).unwrap();
    assert!(expect_bool(send(&mut ch, &format!("newCustomerId,{},5", txn)).await.unwrap()).unwrap());
    assert!(expect_bool(send(&mut ch, &format!("reserveFlight,{},5,9", txn)).await.unwrap()).unwrap());

    cluster.kill(ResourceKind::Car).await;

    let err = send(&mut ch, &format!("reserveCar,{},5,oslo", txn)).await.unwrap_err();
    assert!(matches!(err, CoreError::Unavailable(_)));
    assert!(matches!(
        send(&mut ch, &format!("commit,{}", txn)).await,
        Err(CoreError::TransactionAborted(..))
    ));
    assert!(matches!(
        send(&mut ch, &format!("queryFlight,{},9", txn)).await,
        Err(CoreError::InvalidTransaction(..))
    ));
    assert_eq!(expect_int(send(&mut ch, "queryFlight,-1,9").await.unwrap()).unwrap(), 4);

    // Outside a transaction the failure is just reported
    assert!(matches!(send(&mut ch, "queryCars,-1,oslo").await, Err(CoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_atomic_itinerary_over_the_wire() {
    let cluster = Cluster::start(ItineraryMode::Atomic).await;
    let mut ch = cluster.channel().await;

    for line in ["addFlight,-1,1,2,100", "addFlight,-1,2,0,100", "addCars,-1,lyon,1,40", "newCustomerId,-1,3"] {
        assert!(expect_bool(send(&mut ch, line).await.unwrap()).unwrap());
    }

    assert!(!expect_bool(send(&mut ch, "itinerary,-1,3,1,2,lyon,true,false").await.unwrap()).unwrap());
    assert_eq!(expect_int(send(&mut ch, "queryFlight,-1,1").await.unwrap()).unwrap(), 2);
    assert_eq!(expect_int(send(&mut ch, "queryCars,-1,lyon").await.unwrap()).unwrap(), 1);

    assert!(expect_bool(send(&mut ch, "itinerary,-1,3,1,lyon,true,false").await.unwrap()).unwrap());
    assert_eq!(expect_int(send(&mut ch, "queryFlight,-1,1").await.unwrap()).unwrap(), 1);
    assert_eq!(expect_int(send(&mut ch, "queryCars,-1,lyon").await.unwrap()).unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_every_process() {
    let cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let mut ch = cluster.channel().await;

    let txn = expect_int(send(&mut ch, "start").await.unwrap()).unwrap();
    assert!(!expect_bool(send(&mut ch, "shutdown").await.unwrap()).unwrap());

    send(&mut ch, &format!("abort,{}", txn)).await.unwrap();
    assert!(expect_bool(send(&mut ch, "shutdown").await.unwrap()).unwrap());
    assert!(*cluster.coordinator.shutdown_signal().borrow());
    for kind in ResourceKind::ALL {
        assert!(*cluster.rm(kind).shutdown_signal().borrow());
    }
}

#[tokio::test]
async fn test_repl_session() {
    let cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let mut ch = cluster.channel().await;

    let input = "help\n\
                 start\n\
                 addFlight,1,100,5,300\n\
                 commit,1\n\
                 queryFlight,-1,100\n\
                 queryCustomerInfo,-1,42\n\
                 fly,1\n\
                 addFlight,1,abc\n\
                 abort,1\n\
                 quit\n\
                 start\n";
    let mut output = Vec::new();
    client::run(&mut ch, input.as_bytes(), &mut output).await.unwrap();
    let text = String::from_utf8(output).unwrap();

    assert!(text.contains("itinerary,<txn>,<customer id>"));
    assert!(text.contains("Transaction id: 1"));
    assert!(text.contains("Flight added"));
    assert!(text.contains("Transaction 1 committed"));
    assert!(text.contains("Number of seats available on flight 100: 5"));
    assert!(text.contains("Customer 42 not found"));
    assert!(text.contains("unknown command 'fly'"));
    assert!(text.contains("Usage: addFlight,<txn>,<flight number>,<seats>,<price>"));
    assert!(text.contains("transaction already committed"));
    assert!(text.contains("Quitting client"));
    // Nothing after quit is sent
    assert!(!text.contains("Transaction id: 2"));
}

#[tokio::test]
async fn test_repl_reports_lost_connection() {
    let cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let mut ch = cluster.channel().await;
    assert!(expect_bool(send(&mut ch, "shutdown").await.unwrap()).unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut output = Vec::new();
    let result = client::run(&mut ch, "ping\n".as_bytes(), &mut output).await;
    assert!(matches!(result, Err(client::ClientError::Connection(_))));
}

#[tokio::test]
async fn test_admin_routes() {
    let cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let txn = cluster.coordinator.start().await.unwrap();
    let router = app(AppState::new(cluster.coordinator.clone()));

    let response = router
        .clone()
        .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["live_transactions"], 1);
    assert_eq!(health["itinerary_mode"], "best_effort");

    let response = router
        .clone()
        .oneshot(HttpRequest::get(format!("/v1/transactions/{}", txn)).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let live: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(live["state"], "live");
    assert_eq!(live["status"], "ACTIVE");

    // Removing a live transaction is refused
    let response = router
        .clone()
        .oneshot(
            HttpRequest::delete(format!("/v1/transactions/{}", txn))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = router
        .clone()
        .oneshot(HttpRequest::get("/v1/transactions/999").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router
        .oneshot(HttpRequest::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("wayfare_transactions{outcome=\"started\"} 1"));
    assert!(text.contains("wayfare_live_transactions 1"));
}

#[tokio::test]
async fn test_fault_halts_commit_and_journal_recovers() {
    let cluster = Cluster::start(ItineraryMode::BestEffort).await;
    let router = app(AppState::new(cluster.coordinator.clone()));
    let mut ch = cluster.channel().await;

    let txn = expect_int(send(&mut ch, "start").await.unwrap()).unwrap();
    assert!(expect_bool(send(&mut ch, &format!("addFlight,{},12,4,150", txn)).await.unwrap()).unwrap());
    assert!(expect_bool(send(&mut ch, &format!("addRooms,{},kyoto,2,70", txn)).await.unwrap()).unwrap());

    let response = router
        .clone()
        .oneshot(
            HttpRequest::put("/v1/faults")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"point":"after_decision"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(matches!(send(&mut ch, &format!("commit,{}", txn)).await, Err(CoreError::Internal(_))));
    assert!(matches!(send(&mut ch, "start").await, Err(CoreError::Unavailable(_))));

    let response = router
        .oneshot(HttpRequest::get("/v1/faults").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let faults: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(faults["halted"], "after_decision");
    assert!(faults["armed"].is_null());

    // Nothing was delivered before the halt
    assert_eq!(cluster.rm(ResourceKind::Flight).query_flight(TxnId::GLOBAL, 12).await.unwrap(), 0);

    // A restarted manager finishes the commit from the journal
    let mut participants: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();
    for kind in ResourceKind::ALL {
        participants.insert(kind, cluster.nodes[&kind].rm.clone());
    }
    let journal = Arc::new(FileJournal::new(cluster._dir.path().join("tm_journal.json")));
    let tm = TransactionManager::open(participants, journal, TxnSettings::default())
        .await
        .unwrap();
    assert_eq!(tm.redeliver().await.unwrap(), 1);
    assert_eq!(cluster.rm(ResourceKind::Flight).query_flight(TxnId::GLOBAL, 12).await.unwrap(), 4);
    assert_eq!(cluster.rm(ResourceKind::Room).query_rooms(TxnId::GLOBAL, "kyoto").await.unwrap(), 2);
    assert!(tm.is_idle().await);
}
