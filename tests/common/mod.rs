//! Shared student/classroom enrollment domain for integration tests.

#![allow(dead_code)]

use eventfold_dcb::{
    Command, CommandContext, CommandExecutor, Event, EventOrNone, NewEvent, Tag, TagProjector,
    TagStateError,
};
use serde::{Deserialize, Serialize};

pub fn student_tag(id: &str) -> Tag {
    Tag::new("Student", id).expect("valid student tag")
}

pub fn classroom_tag(id: &str) -> Tag {
    Tag::new("ClassRoom", id).expect("valid classroom tag")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EnrollmentEvent {
    StudentCreated { name: String, max_classes: u32 },
    ClassRoomCreated { name: String, capacity: u32 },
    StudentEnrolled { student_id: String, classroom_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub name: String,
    pub max_classes: u32,
    pub classrooms: Vec<String>,
}

pub struct StudentProjector;

impl TagProjector for StudentProjector {
    const NAME: &'static str = "StudentProjector";
    type State = Student;

    fn project(mut state: Student, event: &Event) -> Student {
        match event.decode::<EnrollmentEvent>() {
            Some(EnrollmentEvent::StudentCreated { name, max_classes }) => {
                state.name = name;
                state.max_classes = max_classes;
            }
            Some(EnrollmentEvent::StudentEnrolled { classroom_id, .. }) => {
                state.classrooms.push(classroom_id);
            }
            _ => {}
        }
        state
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassRoom {
    pub name: String,
    pub capacity: u32,
    pub students: Vec<String>,
}

pub struct ClassRoomProjector;

impl TagProjector for ClassRoomProjector {
    const NAME: &'static str = "ClassRoomProjector";
    type State = ClassRoom;

    fn project(mut state: ClassRoom, event: &Event) -> ClassRoom {
        match event.decode::<EnrollmentEvent>() {
            Some(EnrollmentEvent::ClassRoomCreated { name, capacity }) => {
                state.name = name;
                state.capacity = capacity;
            }
            Some(EnrollmentEvent::StudentEnrolled { student_id, .. }) => {
                state.students.push(student_id);
            }
            _ => {}
        }
        state
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("student {0} does not exist")]
    StudentNotFound(String),
    #[error("classroom {0} does not exist")]
    ClassRoomNotFound(String),
    #[error("classroom {0} is full")]
    ClassRoomFull(String),
    #[error("student {0} cannot take more classes")]
    StudentAtCapacity(String),
    #[error("student {student} is already enrolled in {classroom}")]
    AlreadyEnrolled { student: String, classroom: String },
    #[error(transparent)]
    State(#[from] TagStateError),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

pub struct CreateStudent {
    pub id: String,
    pub name: String,
    pub max_classes: u32,
}

impl Command for CreateStudent {
    type Error = EnrollmentError;

    async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, EnrollmentError> {
        let event = EnrollmentEvent::StudentCreated {
            name: self.name.clone(),
            max_classes: self.max_classes,
        };
        Ok(Some(NewEvent::new(&event, [student_tag(&self.id)])?))
    }
}

pub struct CreateClassRoom {
    pub id: String,
    pub name: String,
    pub capacity: u32,
}

impl Command for CreateClassRoom {
    type Error = EnrollmentError;

    async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, EnrollmentError> {
        let event = EnrollmentEvent::ClassRoomCreated {
            name: self.name.clone(),
            capacity: self.capacity,
        };
        Ok(Some(NewEvent::new(&event, [classroom_tag(&self.id)])?))
    }
}

pub struct EnrollStudent {
    pub student_id: String,
    pub classroom_id: String,
}

impl Command for EnrollStudent {
    type Error = EnrollmentError;

    async fn handle(&self, ctx: &CommandContext) -> Result<EventOrNone, EnrollmentError> {
        let student_tag = student_tag(&self.student_id);
        let classroom_tag = classroom_tag(&self.classroom_id);

        if !ctx.tag_exists(&student_tag).await.map_err(TagStateError::from)? {
            return Err(EnrollmentError::StudentNotFound(self.student_id.clone()));
        }
        if !ctx.tag_exists(&classroom_tag).await.map_err(TagStateError::from)? {
            return Err(EnrollmentError::ClassRoomNotFound(self.classroom_id.clone()));
        }

        let student = ctx.state::<StudentProjector>(&student_tag).await?;
        let classroom = ctx.state::<ClassRoomProjector>(&classroom_tag).await?;

        if classroom.students.contains(&self.student_id) {
            return Err(EnrollmentError::AlreadyEnrolled {
                student: self.student_id.clone(),
                classroom: self.classroom_id.clone(),
            });
        }
        if classroom.students.len() as u32 >= classroom.capacity {
            return Err(EnrollmentError::ClassRoomFull(self.classroom_id.clone()));
        }
        if student.classrooms.len() as u32 >= student.max_classes {
            return Err(EnrollmentError::StudentAtCapacity(self.student_id.clone()));
        }

        let event = EnrollmentEvent::StudentEnrolled {
            student_id: self.student_id.clone(),
            classroom_id: self.classroom_id.clone(),
        };
        Ok(Some(NewEvent::new(&event, [student_tag, classroom_tag])?))
    }
}

pub fn executor() -> CommandExecutor {
    CommandExecutor::builder()
        .projector::<StudentProjector>()
        .projector::<ClassRoomProjector>()
        .build()
}
