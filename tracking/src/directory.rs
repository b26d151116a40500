//! Lookups into the learning platform that the pipeline needs but does not own: users,
//! discussion categories, teams and roles.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::keys::CourseKey;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("connection failed with: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscussionCategory {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Team {
    pub team_id: String,
}

#[async_trait]
pub trait UserDirectory {
    async fn lookup_user(&self, id: i64) -> Result<Option<User>, DirectoryError>;
}

#[async_trait]
pub trait ForumDirectory {
    /// Categories of the given commentables that `user` can see, keyed by commentable id.
    async fn discussion_categories(
        &self,
        course: &CourseKey,
        commentable_ids: &[String],
        user: &User,
    ) -> Result<HashMap<String, DiscussionCategory>, DirectoryError>;

    async fn team_for_commentable(
        &self,
        commentable_id: &str,
    ) -> Result<Option<Team>, DirectoryError>;

    async fn forum_roles(
        &self,
        user: &User,
        course: &CourseKey,
    ) -> Result<Vec<String>, DirectoryError>;

    async fn course_roles(
        &self,
        user: &User,
        course: &CourseKey,
    ) -> Result<Vec<String>, DirectoryError>;

    fn single_thread_url(
        &self,
        course_id: &str,
        commentable_id: &str,
        thread_id: &str,
    ) -> Option<String> {
        if course_id.is_empty() || commentable_id.is_empty() || thread_id.is_empty() {
            return None;
        }
        Some(format!(
            "/courses/{course_id}/discussion/forum/{commentable_id}/threads/{thread_id}"
        ))
    }
}

/// Directory held in memory. Used by tests and by embedders that already know their users.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    users: HashMap<i64, User>,
    categories: HashMap<(String, String), DiscussionCategory>,
    hidden_categories: HashSet<(i64, String)>,
    teams: HashMap<String, Team>,
    forum_roles: HashMap<(i64, String), Vec<String>>,
    course_roles: HashMap<(i64, String), Vec<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, id: i64, username: &str) -> Self {
        self.users.insert(
            id,
            User {
                id,
                username: username.to_owned(),
            },
        );
        self
    }

    pub fn with_category(mut self, course: &CourseKey, commentable_id: &str, title: &str) -> Self {
        self.categories.insert(
            (course.to_string(), commentable_id.to_owned()),
            DiscussionCategory {
                title: title.to_owned(),
            },
        );
        self
    }

    /// Hide a category from one user, as cohorted discussions are.
    pub fn without_access(mut self, user_id: i64, commentable_id: &str) -> Self {
        self.hidden_categories
            .insert((user_id, commentable_id.to_owned()));
        self
    }

    pub fn with_team(mut self, commentable_id: &str, team_id: &str) -> Self {
        self.teams.insert(
            commentable_id.to_owned(),
            Team {
                team_id: team_id.to_owned(),
            },
        );
        self
    }

    pub fn with_forum_role(mut self, user_id: i64, course: &CourseKey, role: &str) -> Self {
        self.forum_roles
            .entry((user_id, course.to_string()))
            .or_default()
            .push(role.to_owned());
        self
    }

    pub fn with_course_role(mut self, user_id: i64, course: &CourseKey, role: &str) -> Self {
        self.course_roles
            .entry((user_id, course.to_string()))
            .or_default()
            .push(role.to_owned());
        self
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn lookup_user(&self, id: i64) -> Result<Option<User>, DirectoryError> {
        Ok(self.users.get(&id).cloned())
    }
}

#[async_trait]
impl ForumDirectory for MemoryDirectory {
    async fn discussion_categories(
        &self,
        course: &CourseKey,
        commentable_ids: &[String],
        user: &User,
    ) -> Result<HashMap<String, DiscussionCategory>, DirectoryError> {
        let course = course.to_string();
        Ok(commentable_ids
            .iter()
            .filter(|id| !self.hidden_categories.contains(&(user.id, (*id).clone())))
            .filter_map(|id| {
                self.categories
                    .get(&(course.clone(), id.clone()))
                    .map(|category| (id.clone(), category.clone()))
            })
            .collect())
    }

    async fn team_for_commentable(
        &self,
        commentable_id: &str,
    ) -> Result<Option<Team>, DirectoryError> {
        Ok(self.teams.get(commentable_id).cloned())
    }

    async fn forum_roles(
        &self,
        user: &User,
        course: &CourseKey,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .forum_roles
            .get(&(user.id, course.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn course_roles(
        &self,
        user: &User,
        course: &CourseKey,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .course_roles
            .get(&(user.id, course.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Directory reading the platform's own tables.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(url: &str, max_connections: u32) -> Result<Self, DirectoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(DirectoryError::ConnectionError)?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> DirectoryError + '_ {
    move |error| DirectoryError::QueryError {
        command: command.to_owned(),
        error,
    }
}

#[async_trait]
impl UserDirectory for PgDirectory {
    async fn lookup_user(&self, id: i64) -> Result<Option<User>, DirectoryError> {
        let base_query = r#"
SELECT id::BIGINT AS id, username
FROM auth_user
WHERE id = $1
        "#;

        sqlx::query_as::<_, User>(base_query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT auth_user"))
    }
}

#[async_trait]
impl ForumDirectory for PgDirectory {
    async fn discussion_categories(
        &self,
        course: &CourseKey,
        commentable_ids: &[String],
        _user: &User,
    ) -> Result<HashMap<String, DiscussionCategory>, DirectoryError> {
        // TODO: apply cohort visibility once the divided discussion settings are readable here
        let base_query = r#"
SELECT external_id, title
FROM discussions_discussiontopiclink
WHERE context_key = $1 AND external_id = ANY($2) AND enabled_in_context
        "#;

        let rows: Vec<(String, String)> = sqlx::query_as(base_query)
            .bind(course.to_string())
            .bind(commentable_ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT discussions_discussiontopiclink"))?;

        Ok(rows
            .into_iter()
            .map(|(id, title)| (id, DiscussionCategory { title }))
            .collect())
    }

    async fn team_for_commentable(
        &self,
        commentable_id: &str,
    ) -> Result<Option<Team>, DirectoryError> {
        let base_query = r#"
SELECT team_id
FROM teams_courseteam
WHERE discussion_topic_id = $1
LIMIT 1
        "#;

        sqlx::query_as::<_, Team>(base_query)
            .bind(commentable_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT teams_courseteam"))
    }

    async fn forum_roles(
        &self,
        user: &User,
        course: &CourseKey,
    ) -> Result<Vec<String>, DirectoryError> {
        let base_query = r#"
SELECT role.name
FROM django_comment_client_role AS role
JOIN django_comment_client_role_users AS membership ON membership.role_id = role.id
WHERE membership.user_id = $1 AND role.course_id = $2
        "#;

        sqlx::query_scalar::<_, String>(base_query)
            .bind(user.id)
            .bind(course.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT django_comment_client_role"))
    }

    async fn course_roles(
        &self,
        user: &User,
        course: &CourseKey,
    ) -> Result<Vec<String>, DirectoryError> {
        let base_query = r#"
SELECT role
FROM student_courseaccessrole
WHERE user_id = $1 AND course_id = $2
        "#;

        sqlx::query_scalar::<_, String>(base_query)
            .bind(user.id)
            .bind(course.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT student_courseaccessrole"))
    }
}
