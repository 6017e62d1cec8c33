use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::resp::problem::{problems, Problem};
use crate::util;

/// Query string filters of the content listings.
#[derive(Debug, Clone, Default, FromForm, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ContentQuery {
    pub subject: Option<String>,
    pub grade: Option<u8>,
    /// Matches title and description.
    pub search: Option<String>,
    /// Ignored by the student listing.
    pub published: Option<bool>,
}

impl ContentQuery {
    fn apply_common(&self, filters: &mut Vec<Document>, search_subject: bool) -> Result<(), Problem> {
        if let Some(subject) = &self.subject {
            if subject.trim().is_empty() {
                return Err(problems::invalid_field("subject", "Subject cannot be empty."));
            }
            filters.push(doc! { "subject": subject.trim().to_lowercase() });
        }
        if let Some(grade) = self.grade {
            filters.push(doc! { "grade": crate::data::validate::grade(grade)? as i32 });
        }
        if let Some(search) = self.search.as_deref().filter(|it| !it.trim().is_empty()) {
            let regex = util::escape_search(search);
            let mut fields = vec![
                doc! { "title": regex.clone() },
                doc! { "description": regex.clone() },
            ];
            if search_subject {
                fields.push(doc! { "subject": regex });
            }
            filters.push(doc! { "$or": fields });
        }
        Ok(())
    }

    /// Published, unexpired content the student is admitted to.
    pub fn student_filter(&self, student: Uuid, now: DateTime<Utc>) -> Result<Document, Problem> {
        let now = bson::DateTime::from_chrono(now);
        let mut filters = vec![
            doc! { "is_published": true },
            doc! { "$or": [ { "expires_at": Bson::Null }, { "expires_at": { "$gt": now } } ] },
            doc! { "$or": [
                { "access": "all" },
                { "access": "specific", "allowed_students": util::bson_uuid(student) },
            ] },
        ];
        self.apply_common(&mut filters, false)?;
        Ok(doc! { "$and": filters })
    }

    /// Everything a teacher owns, drafts included.
    pub fn teacher_filter(&self, teacher: Uuid) -> Result<Document, Problem> {
        let mut filters = vec![doc! { "teacher": util::bson_uuid(teacher) }];
        self.apply_common(&mut filters, true)?;
        if let Some(published) = self.published {
            filters.push(doc! { "is_published": published });
        }
        Ok(doc! { "$and": filters })
    }

    pub fn admin_filter(&self) -> Result<Document, Problem> {
        let mut filters = vec![];
        self.apply_common(&mut filters, true)?;
        if let Some(published) = self.published {
            filters.push(doc! { "is_published": published });
        }
        Ok(if filters.is_empty() {
            Document::new()
        } else {
            doc! { "$and": filters }
        })
    }
}

pub fn newest_published() -> Document {
    doc! { "published_at": -1, "created_at": -1 }
}

pub fn newest_created() -> Document {
    doc! { "created_at": -1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_filter_requires_publication_and_access() {
        let student = Uuid::new_v4();
        let filter = ContentQuery::default()
            .student_filter(student, Utc::now())
            .unwrap();
        let clauses = filter.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 3);
        assert_eq!(
            clauses[0].as_document().unwrap().get_bool("is_published"),
            Ok(true)
        );
    }

    #[test]
    fn filters_are_added_when_present() {
        let query = ContentQuery {
            subject: Some(" Math ".to_string()),
            grade: Some(7),
            search: Some("frac".to_string()),
            published: None,
        };
        let filter = query.student_filter(Uuid::new_v4(), Utc::now()).unwrap();
        let clauses = filter.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 6);
        assert_eq!(
            clauses[3].as_document().unwrap().get_str("subject"),
            Ok("math")
        );
    }

    #[test]
    fn empty_subject_is_rejected() {
        let query = ContentQuery {
            subject: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(query.teacher_filter(Uuid::new_v4()).is_err());
    }

    #[test]
    fn invalid_grade_is_rejected() {
        let query = ContentQuery {
            grade: Some(14),
            ..Default::default()
        };
        assert!(query.admin_filter().is_err());
    }

    #[test]
    fn admin_filter_without_criteria_matches_everything() {
        assert!(ContentQuery::default().admin_filter().unwrap().is_empty());

        let published = ContentQuery {
            published: Some(false),
            ..Default::default()
        };
        let filter = published.admin_filter().unwrap();
        assert_eq!(filter.get_array("$and").unwrap().len(), 1);
    }

    #[test]
    fn teacher_search_covers_subject() {
        let query = ContentQuery {
            search: Some("math".to_string()),
            ..Default::default()
        };
        let filter = query.teacher_filter(Uuid::new_v4()).unwrap();
        let clauses = filter.get_array("$and").unwrap();
        let or = clauses[1]
            .as_document()
            .unwrap()
            .get_array("$or")
            .unwrap();
        assert_eq!(or.len(), 3);
    }
}
