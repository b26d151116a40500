//! Mobile screen views of forum threads, rewritten as `edx.forum.thread.viewed` and
//! enriched with what the web forum reports for the same action.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{TransformError, Transformation, Transformer};
use crate::directory::{ForumDirectory, User, UserDirectory};
use crate::keys::CourseKey;

pub const THREAD_VIEWED: &str = "edx.forum.thread.viewed";

#[derive(Debug, Clone)]
pub struct ForumSettings {
    /// Name of the mobile screen-view event.
    pub match_key: String,
    /// `context.label` marking a screen view as a thread view.
    pub label: String,
    pub max_title_chars: usize,
    pub max_body_chars: usize,
}

impl Default for ForumSettings {
    fn default() -> Self {
        Self {
            match_key: "edx.bi.app.navigation.screen".to_owned(),
            label: "Forum: View Thread".to_owned(),
            max_title_chars: 1000,
            max_body_chars: 2000,
        }
    }
}

/// Truncate `field` to `max_chars` characters, recording whether anything was cut.
fn truncate_field(event: &mut Transformation, field: &str, flag: &str, max_chars: usize) {
    let payload = event.payload_mut();
    let Some(text) = payload.get(field).and_then(Value::as_str) else {
        return;
    };

    let truncated = text.chars().count() > max_chars;
    let text: String = text.chars().take(max_chars).collect();
    payload.insert(field.to_owned(), text.into());
    payload.insert(flag.to_owned(), truncated.into());
}

fn context_user_id(event: &Transformation) -> Option<i64> {
    match event.context()?.get("user_id")? {
        Value::Number(number) => number.as_i64(),
        Value::String(id) => id.parse().ok(),
        _ => None,
    }
}

pub struct ForumThreadViewedTransformer {
    settings: ForumSettings,
    users: Arc<dyn UserDirectory + Send + Sync>,
    forum: Arc<dyn ForumDirectory + Send + Sync>,
}

impl ForumThreadViewedTransformer {
    pub fn new(
        settings: ForumSettings,
        users: Arc<dyn UserDirectory + Send + Sync>,
        forum: Arc<dyn ForumDirectory + Send + Sync>,
    ) -> Self {
        Self {
            settings,
            users,
            forum,
        }
    }

    async fn resolve_user(&self, event: &Transformation) -> Option<User> {
        let user_id = context_user_id(event)?;
        match self.users.lookup_user(user_id).await {
            Ok(user) => user,
            Err(error) => {
                warn!(user_id, %error, "unable to look up forum user");
                None
            }
        }
    }

    async fn add_category(
        &self,
        event: &mut Transformation,
        course: &CourseKey,
        commentable_id: &str,
        user: &User,
    ) {
        let ids = [commentable_id.to_owned()];
        match self.forum.discussion_categories(course, &ids, user).await {
            Ok(categories) => {
                if let Some(category) = categories.get(commentable_id) {
                    let payload = event.payload_mut();
                    payload.insert("category_id".to_owned(), commentable_id.into());
                    payload.insert("category_name".to_owned(), category.title.clone().into());
                }
            }
            Err(error) => warn!(commentable_id, %error, "unable to resolve discussion category"),
        }
    }

    async fn add_roles(&self, event: &mut Transformation, course: &CourseKey, user: &User) {
        match self.forum.forum_roles(user, course).await {
            Ok(roles) => {
                event
                    .payload_mut()
                    .insert("user_forums_roles".to_owned(), roles.into());
            }
            Err(error) => warn!(user_id = user.id, %error, "unable to look up forum roles"),
        }

        match self.forum.course_roles(user, course).await {
            Ok(roles) => {
                event
                    .payload_mut()
                    .insert("user_course_roles".to_owned(), roles.into());
            }
            Err(error) => warn!(user_id = user.id, %error, "unable to look up course roles"),
        }
    }

    async fn add_team(&self, event: &mut Transformation, commentable_id: &str) {
        match self.forum.team_for_commentable(commentable_id).await {
            Ok(Some(team)) => {
                event
                    .payload_mut()
                    .insert("team_id".to_owned(), team.team_id.into());
            }
            Ok(None) => {}
            Err(error) => warn!(commentable_id, %error, "unable to look up discussion team"),
        }
    }

    async fn enrich(&self, event: &mut Transformation) {
        let course_id = event
            .context()
            .and_then(|context| context.get("course_id"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let course = match course_id.as_deref().map(str::parse::<CourseKey>) {
            Some(Ok(course)) => Some(course),
            Some(Err(error)) => {
                warn!(%error, "forum thread view has an invalid course_id");
                None
            }
            None => None,
        };
        let payload_str = |event: &Transformation, field: &str| {
            event
                .payload()
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        let commentable_id = payload_str(event, "commentable_id");
        let thread_id = payload_str(event, "id");
        let user = self.resolve_user(event).await;

        if let (Some(course), Some(commentable_id), Some(user)) =
            (&course, &commentable_id, &user)
        {
            self.add_category(event, course, commentable_id, user).await;
        }

        if let (Some(course_id), Some(commentable_id), Some(thread_id)) =
            (&course_id, &commentable_id, &thread_id)
        {
            if let Some(url) = self
                .forum
                .single_thread_url(course_id, commentable_id, thread_id)
            {
                event.payload_mut().insert("url".to_owned(), url.into());
            }
        }

        if let (Some(course), Some(user)) = (&course, &user) {
            self.add_roles(event, course, user).await;
        }

        if let Some(commentable_id) = &commentable_id {
            self.add_team(event, commentable_id).await;
        }
    }
}

#[async_trait]
impl Transformer for ForumThreadViewedTransformer {
    fn match_key(&self) -> &str {
        &self.settings.match_key
    }

    async fn process_event(&self, event: &mut Transformation) -> Result<(), TransformError> {
        let label = event
            .context()
            .and_then(|context| context.get("label"))
            .and_then(Value::as_str);
        if label != Some(self.settings.label.as_str()) {
            return Err(TransformError::EmissionExit);
        }

        event.set_name(THREAD_VIEWED);
        event.set_event_type(THREAD_VIEWED);

        event.rename_payload_key("thread_id", "id");
        event.rename_payload_key("topic_id", "commentable_id");
        event.rename_payload_key("author", "target_username");
        if event.rename_payload_key("action", "title").is_some() {
            truncate_field(event, "title", "title_truncated", self.settings.max_title_chars);
        }
        truncate_field(event, "body", "truncated", self.settings.max_body_chars);

        self.enrich(event).await;
        Ok(())
    }
}
