use async_trait::async_trait;
use chrono::Duration;
use reaction_sync::adapters::owntracks::{LocationReceiver, OwntracksAdapter, Receipt};
use reaction_sync::adapters::AdapterContext;
use reaction_sync::db::{self, SqliteContentStore, SqliteCredentialStore};
use reaction_sync::geocode::{Geocoder, Place};
use reaction_sync::model::{field, Kind, Service, Status};
use reaction_sync::store::{ContentStore, CredentialStore};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

const TST: i64 = 1_714_564_800;

/// Answers every lookup with a fixed place, or fails when `place` is `None`.
#[derive(Clone, Default)]
struct FixedGeocoder {
    place: Option<Place>,
    calls: Arc<Mutex<Vec<(f64, f64)>>>,
}

impl FixedGeocoder {
    fn with_place(place: Place) -> Self {
        Self {
            place: Some(place),
            ..Default::default()
        }
    }

    async fn calls(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn reverse(&self, lat: f64, lon: f64) -> anyhow::Result<Option<Place>> {
        self.calls.lock().await.push((lat, lon));
        match &self.place {
            Some(place) => Ok(Some(place.clone())),
            None => anyhow::bail!("geocoder unavailable"),
        }
    }
}

async fn receiver(geocoder: Option<FixedGeocoder>) -> (LocationReceiver, Arc<dyn ContentStore>) {
    let pool = db::memory_pool().await.unwrap();
    let store: Arc<dyn ContentStore> = Arc::new(SqliteContentStore::new(pool.clone()));
    let credentials: Arc<dyn CredentialStore> = Arc::new(SqliteCredentialStore::new(pool));
    let ctx = AdapterContext::new(
        credentials,
        Url::parse("https://blog.example.com/").unwrap(),
        std::time::Duration::from_secs(5),
    )
    .unwrap();
    let geocoder = geocoder.map(|g| Arc::new(g) as Arc<dyn Geocoder>);
    let receiver = LocationReceiver::new(
        OwntracksAdapter::new(ctx),
        store.clone(),
        geocoder,
        Status::Private,
        0.001,
        Duration::minutes(5),
    );
    (receiver, store)
}

fn location(lat: f64, lon: f64, tst: i64) -> serde_json::Value {
    json!({ "_type": "location", "lat": lat, "lon": lon, "tst": tst, "tid": "ph", "acc": 12 })
}

fn created(receipt: Receipt) -> String {
    match receipt {
        Receipt::Created(id) => id,
        other => panic!("expected a new record, got {other:?}"),
    }
}

#[tokio::test]
async fn nearby_pushes_collapse_into_one_checkin() {
    let (receiver, store) = receiver(None).await;
    let id = created(receiver.receive(&location(51.5076, -0.0994, TST)).await.unwrap());

    let again = receiver
        .receive(&location(51.5081, -0.0994, TST + 120))
        .await
        .unwrap();
    assert_eq!(again, Receipt::Duplicate(id.clone()));

    // Replaying the same push hits the external id first.
    let replay = receiver.receive(&location(51.5076, -0.0994, TST)).await.unwrap();
    assert_eq!(replay, Receipt::Duplicate(id.clone()));

    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.kind, Kind::Checkin);
    assert_eq!(rec.status, Status::Private);
    assert_eq!(rec.imported_from, Some(Service::Owntracks));
    assert_eq!(rec.coordinates(), Some((51.5076, -0.0994)));
    assert!(rec.external_ids.contains_key(&Service::Owntracks));
}

#[tokio::test]
async fn distant_or_later_pushes_are_new_checkins() {
    let (receiver, _store) = receiver(None).await;
    let first = created(receiver.receive(&location(51.5076, -0.0994, TST)).await.unwrap());
    let far = created(receiver.receive(&location(51.5200, -0.0994, TST + 60)).await.unwrap());
    let later = created(
        receiver
            .receive(&location(51.5076, -0.0994, TST + 6 * 60))
            .await
            .unwrap(),
    );
    assert_ne!(first, far);
    assert_ne!(first, later);
}

#[tokio::test]
async fn geocoding_fills_address_fields() {
    let geocoder = FixedGeocoder::with_place(Place {
        name: Some("Tate Modern".into()),
        address: Some("Bankside".into()),
        locality: Some("London".into()),
        region: Some("England".into()),
        country: Some("United Kingdom".into()),
    });
    let (receiver, store) = receiver(Some(geocoder.clone())).await;
    let id = created(receiver.receive(&location(51.5076, -0.0994, TST)).await.unwrap());

    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.field(field::VENUE_NAME), Some("Tate Modern"));
    assert_eq!(rec.field(field::LOCALITY), Some("London"));
    assert_eq!(rec.field(field::COUNTRY), Some("United Kingdom"));
    assert_eq!(geocoder.calls().await, 1);
}

#[tokio::test]
async fn region_name_wins_over_geocoded_name() {
    let geocoder = FixedGeocoder::with_place(Place {
        name: Some("Some Building".into()),
        locality: Some("London".into()),
        ..Default::default()
    });
    let (receiver, store) = receiver(Some(geocoder)).await;
    let mut push = location(51.5076, -0.0994, TST);
    push["inregions"] = json!(["Office"]);
    let id = created(receiver.receive(&push).await.unwrap());

    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.field(field::VENUE_NAME), Some("Office"));
    assert_eq!(rec.field(field::LOCALITY), Some("London"));
}

#[tokio::test]
async fn geocoder_failure_still_stores_the_checkin() {
    let geocoder = FixedGeocoder::default();
    let (receiver, store) = receiver(Some(geocoder.clone())).await;
    let id = created(receiver.receive(&location(48.8584, 2.2945, TST)).await.unwrap());

    let rec = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.field(field::LOCALITY), None);
    assert_eq!(rec.coordinates(), Some((48.8584, 2.2945)));
    assert_eq!(geocoder.calls().await, 1);
}

#[tokio::test]
async fn non_location_messages_are_ignored() {
    let (receiver, _store) = receiver(None).await;
    let receipt = receiver
        .receive(&json!({ "_type": "lwt", "tst": TST }))
        .await
        .unwrap();
    assert_eq!(receipt, Receipt::Ignored("lwt".into()));

    let leave = json!({
        "_type": "transition", "event": "leave", "desc": "Home",
        "lat": 51.5, "lon": -0.1, "tst": TST
    });
    assert!(matches!(receiver.receive(&leave).await.unwrap(), Receipt::Ignored(_)));

    assert!(receiver
        .receive(&json!({ "_type": "location", "lat": 91.0, "lon": 0.0, "tst": TST }))
        .await
        .is_err());
}
