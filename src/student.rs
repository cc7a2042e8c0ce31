//! The Student projection
//!
//! The document is generic; this is the human-meaningful view the editor
//! works with. It is always derived from materialized state and written
//! back through a [`Transaction`], never stored on its own.

use serde::{Deserialize, Serialize};

use crate::convergent::{DocumentState, Transaction, Value};

/// Path of the object holding the student record
pub const STUDENT_OBJ: &[&str] = &["student"];

const NAME_KEY: &str = "studentName";
const AGE_KEY: &str = "age";
const CLASS_KEY: &str = "class";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub student_name: String,
    pub age: i64,
    pub class: String,
}

impl Student {
    pub fn new(student_name: impl Into<String>, age: i64, class: impl Into<String>) -> Self {
        Self {
            student_name: student_name.into(),
            age,
            class: class.into(),
        }
    }

    /// Project the student record out of materialized state. Missing
    /// fields take their defaults, so an empty document projects to
    /// `Student::default()`.
    pub fn project(state: &DocumentState) -> Self {
        let text = |key: &str| {
            state
                .get(STUDENT_OBJ, key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        Self {
            student_name: text(NAME_KEY),
            age: state
                .get(STUDENT_OBJ, AGE_KEY)
                .and_then(Value::as_int)
                .unwrap_or_default(),
            class: text(CLASS_KEY),
        }
    }

    /// Write every field into the student object, creating it if needed.
    pub fn write_into(&self, tx: &mut Transaction) {
        tx.put(STUDENT_OBJ, NAME_KEY, self.student_name.as_str());
        tx.put(STUDENT_OBJ, AGE_KEY, self.age);
        tx.put(STUDENT_OBJ, CLASS_KEY, self.class.as_str());
    }

    /// Change message recorded for an edit of the whole record
    pub fn edit_message(&self) -> String {
        format!(
            "Edit Student {}, {}, {}",
            self.student_name, self.age, self.class
        )
    }
}
