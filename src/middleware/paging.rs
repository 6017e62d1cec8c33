use std::convert::Infallible;

use rocket::request::{FromRequest, Outcome, Request};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::data::content::ContentResponse;
use crate::data::notification::NotificationResponse;
use crate::data::user::UserResponse;

pub const MAX_PAGE_LENGTH: u32 = 100;

/// Page requested through `page`/`p` (1-based) and `limit`/`len`/`l` query values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PageState {
    pub page: u32,
    pub limit: Option<u32>,
}

impl Default for PageState {
    fn default() -> Self {
        PageState {
            page: 1,
            limit: None,
        }
    }
}

impl PageState {
    pub fn new(page: u32, limit: u32) -> PageState {
        PageState {
            page: page.max(1),
            limit: Some(limit),
        }
    }

    pub fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_PAGE_LENGTH)
    }

    pub fn skip(&self, limit: u32) -> u64 {
        (self.page.max(1) as u64 - 1) * limit as u64
    }

    pub fn info(&self, limit: u32, total: u64) -> PageInfo {
        let pages = if total == 0 {
            0
        } else {
            (total + limit as u64 - 1) / limit as u64
        };
        PageInfo {
            total,
            page: self.page.max(1),
            limit,
            pages,
            has_next_page: (self.page.max(1) as u64) < pages,
            has_previous_page: self.page > 1,
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for PageState {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let query_u32 = |names: &[&str]| -> Option<u32> {
            names
                .iter()
                .find_map(|name| request.query_value::<u32>(name).and_then(|it| it.ok()))
        };

        Outcome::Success(PageState {
            page: query_u32(&["page", "p"]).unwrap_or(1).max(1),
            limit: query_u32(&["limit", "len", "l"]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PageInfo {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub pages: u64,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[aliases(
    UserPage = Paginated<UserResponse>,
    ContentPage = Paginated<ContentResponse>,
    NotificationPage = Paginated<NotificationResponse>
)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, pagination: PageInfo) -> Paginated<T> {
        Paginated { data, pagination }
    }
}
