//! Student enrollment with Dynamic Consistency Boundaries.
//!
//! Enrolling a student touches two tags, `Student:<id>` and
//! `ClassRoom:<id>`. Both are reserved for the write, so a classroom can
//! never be overbooked even when enrollments race.
//!
//! Run with: `cargo run --example enrollment`

use std::sync::Arc;
use std::time::Duration;

use eventfold_dcb::{
    Command, CommandContext, CommandExecutor, CommandMetadata, Event, EventOrNone,
    InMemoryEventStore, LiveConfig, NewEvent, Tag, TagGroupProjector, TagProjector,
    TagStateError, spawn_live_projection,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Events and tag projectors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum EnrollmentEvent {
    StudentCreated { name: String },
    ClassRoomCreated { name: String, capacity: u32 },
    StudentEnrolled { student_id: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClassRoom {
    name: String,
    capacity: u32,
    students: Vec<String>,
}

struct ClassRoomProjector;

impl TagProjector for ClassRoomProjector {
    const NAME: &'static str = "ClassRoomProjector";
    type State = ClassRoom;

    fn project(mut state: ClassRoom, event: &Event) -> ClassRoom {
        match event.decode::<EnrollmentEvent>() {
            Some(EnrollmentEvent::ClassRoomCreated { name, capacity }) => {
                state.name = name;
                state.capacity = capacity;
            }
            Some(EnrollmentEvent::StudentEnrolled { student_id }) => {
                state.students.push(student_id);
            }
            _ => {}
        }
        state
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum EnrollmentError {
    #[error("classroom {0} is full")]
    Full(String),
    #[error(transparent)]
    State(#[from] TagStateError),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

fn tag(group: &str, id: &str) -> Tag {
    Tag::new(group, id).expect("demo tags are valid")
}

struct CreateStudent {
    id: &'static str,
    name: &'static str,
}

impl Command for CreateStudent {
    type Error = EnrollmentError;

    async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, EnrollmentError> {
        let event = EnrollmentEvent::StudentCreated {
            name: self.name.to_owned(),
        };
        Ok(Some(NewEvent::new(&event, [tag("Student", self.id)])?))
    }
}

struct CreateClassRoom {
    id: &'static str,
    name: &'static str,
    capacity: u32,
}

impl Command for CreateClassRoom {
    type Error = EnrollmentError;

    async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, EnrollmentError> {
        let event = EnrollmentEvent::ClassRoomCreated {
            name: self.name.to_owned(),
            capacity: self.capacity,
        };
        Ok(Some(NewEvent::new(&event, [tag("ClassRoom", self.id)])?))
    }
}

struct EnrollStudent {
    student_id: &'static str,
    classroom_id: &'static str,
}

impl Command for EnrollStudent {
    type Error = EnrollmentError;

    async fn handle(&self, ctx: &CommandContext) -> Result<EventOrNone, EnrollmentError> {
        let classroom_tag = tag("ClassRoom", self.classroom_id);
        let room = ctx.state::<ClassRoomProjector>(&classroom_tag).await?;
        if room.students.len() as u32 >= room.capacity {
            return Err(EnrollmentError::Full(self.classroom_id.to_owned()));
        }
        let event = EnrollmentEvent::StudentEnrolled {
            student_id: self.student_id.to_owned(),
        };
        Ok(Some(NewEvent::new(
            &event,
            [tag("Student", self.student_id), classroom_tag],
        )?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryEventStore::new());
    let executor = CommandExecutor::builder()
        .event_store(store.clone())
        .projector::<ClassRoomProjector>()
        .executor_name("enrollment-demo")
        .build();

    // A live read model over every classroom.
    let rooms = spawn_live_projection(
        TagGroupProjector::<ClassRoomProjector>::new("ClassRoom"),
        store.clone(),
        LiveConfig {
            safe_window: Duration::from_millis(200),
            threshold_interval: Duration::from_millis(50),
        },
    );

    let meta = CommandMetadata::default().with_executed_by("registrar");
    executor
        .execute(
            CreateClassRoom {
                id: "math",
                name: "Mathematics",
                capacity: 2,
            },
            meta.clone(),
        )
        .await?;

    let students = [("s1", "Ada"), ("s2", "Brian"), ("s3", "Chen"), ("s4", "Dora")];
    for (id, name) in students {
        executor
            .execute(CreateStudent { id, name }, meta.clone())
            .await?;
    }

    // Four students race for two seats.
    let mut set = tokio::task::JoinSet::new();
    for (id, _) in students {
        let executor = executor.clone();
        let meta = meta.clone();
        set.spawn(async move {
            let result = executor
                .execute(
                    EnrollStudent {
                        student_id: id,
                        classroom_id: "math",
                    },
                    meta,
                )
                .await;
            (id, result)
        });
    }

    let mut seated = 0;
    while let Some(joined) = set.join_next().await {
        let (id, result) = joined?;
        match result {
            Ok(result) => {
                seated += 1;
                println!("{id}: enrolled in {:?}", result.elapsed);
            }
            Err(e) if e.is_contention() => println!("{id}: lost the race ({e})"),
            Err(e) => println!("{id}: rejected ({e})"),
        }
    }

    // Let the safe window pass so the read model settles.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (enrolled, safe) = rooms
        .with_runner(|runner| {
            let room_tag = tag("ClassRoom", "math");
            let enrolled = runner
                .state()
                .get(&room_tag)
                .map(|room| room.students.len())
                .unwrap_or(0);
            (enrolled, !runner.state().is_item_unsafe(&room_tag))
        })
        .await;
    println!("math: {enrolled} enrolled, settled = {safe}");
    rooms.shutdown().await?;

    assert!(seated <= 2, "a classroom of two never seats more");
    assert_eq!(enrolled, seated);
    println!("all assertions passed");

    Ok(())
}
