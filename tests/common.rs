#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use spitedb_live::{
    Error, Event, InMemoryEventStore, LiveQueryChanges, LiveQueryEvent, Model, PartitionKey, Projection, Query,
    QueryEngine,
};

// =============================================================================
// Room Booking Fixtures
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub start: &'static str,
    pub end: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub number: u32,
    pub hotel: Option<PartitionKey>,
    pub bookings: Vec<Booking>,
}

#[derive(Default)]
pub struct RoomModel {
    pub rooms: BTreeMap<u32, Room>,
}

impl Model for RoomModel {}

#[derive(Debug)]
pub struct RoomAdded {
    pub number: u32,
    pub hotel: Option<PartitionKey>,
}

impl RoomAdded {
    pub fn new(number: u32) -> Self {
        Self { number, hotel: None }
    }

    pub fn in_hotel(number: u32, hotel: PartitionKey) -> Self {
        Self {
            number,
            hotel: Some(hotel),
        }
    }
}

impl Event for RoomAdded {
    const NAME: &'static str = "RoomAdded";
}

#[derive(Debug)]
pub struct RoomBooked {
    pub number: u32,
    pub start: &'static str,
    pub end: &'static str,
}

impl Event for RoomBooked {
    const NAME: &'static str = "RoomBooked";
}

/// Not declared by the rooms projection.
#[derive(Debug)]
pub struct RoomRenovated {
    pub number: u32,
}

impl Event for RoomRenovated {
    const NAME: &'static str = "RoomRenovated";
}

/// A single room, unpartitioned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GetRoom(pub u32);

impl Query for GetRoom {
    type Model = RoomModel;
    type Result = Option<Room>;
}

/// Room numbers of one hotel, partitioned by hotel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HotelRooms(pub PartitionKey);

impl Query for HotelRooms {
    type Model = RoomModel;
    type Result = Vec<u32>;
}

/// Booking count of a room; fails once the room is double booked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SingleBooking(pub u32);

impl Query for SingleBooking {
    type Model = RoomModel;
    type Result = usize;
}

pub fn rooms_projection() -> Projection<RoomModel> {
    Projection::builder("rooms")
        .on::<RoomAdded, _>(|model: &mut RoomModel, _meta, ev| {
            model.rooms.insert(
                ev.number,
                Room {
                    number: ev.number,
                    hotel: ev.hotel,
                    bookings: Vec::new(),
                },
            );
        })
        .try_on::<RoomBooked, _, String>(|model: &mut RoomModel, _meta, ev| {
            let room = model
                .rooms
                .get_mut(&ev.number)
                .ok_or_else(|| format!("room {} does not exist", ev.number))?;
            room.bookings.push(Booking {
                start: ev.start,
                end: ev.end,
            });
            Ok(())
        })
        .build()
}

pub fn room_engine(store: &Arc<InMemoryEventStore>) -> QueryEngine<RoomModel> {
    init_tracing();

    QueryEngine::builder(store.clone())
        .projection(rooms_projection())
        .query::<GetRoom, _>(|model, query| Ok(model.rooms.get(&query.0).cloned()))
        .query::<HotelRooms, _>(|model, query| {
            Ok(model
                .rooms
                .values()
                .filter(|room| room.hotel == Some(query.0))
                .map(|room| room.number)
                .collect())
        })
        .partitioner::<HotelRooms, _>(|_, query| Some(query.0))
        .query::<SingleBooking, _>(|model, query| {
            let bookings = model.rooms.get(&query.0).map_or(0, |room| room.bookings.len());
            if bookings > 1 {
                return Err(Error::query_failed::<SingleBooking>(format!("room {} is double booked", query.0)));
            }
            Ok(bookings)
        })
        .build()
        .unwrap()
}

// =============================================================================
// Helpers
// =============================================================================

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Waits for the next notification, failing the test after one second.
pub async fn next_change(changes: &mut LiveQueryChanges) -> LiveQueryEvent {
    tokio::time::timeout(Duration::from_secs(1), changes.next())
        .await
        .expect("no notification within 1s")
        .expect("notification channel closed")
}

/// Asserts that no notification arrives within `quiet`.
pub async fn assert_quiet(changes: &mut LiveQueryChanges, quiet: Duration) {
    if let Ok(change) = tokio::time::timeout(quiet, changes.next()).await {
        panic!("unexpected notification: {:?}", change);
    }
}
