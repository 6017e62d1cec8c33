use rocket::http::Status;
use rocket::{Catcher, Request};

use super::problem::{problems, Problem};

#[catch(400)]
fn bad_request(_: &Request) -> Problem {
    problems::parse_problem()
}

/// Rocket answers 422 when a JSON or form body doesn't match its type.
#[catch(422)]
fn unprocessable(_: &Request) -> Problem {
    problems::parse_problem()
        .detail("The request body is missing fields or has fields of the wrong type.")
        .to_owned()
}

#[catch(401)]
fn unauthorized(_: &Request) -> Problem {
    super::jwt::auth_problem("Access denied. No valid token provided.")
}

#[catch(403)]
fn forbidden(_: &Request) -> Problem {
    problems::forbidden("Insufficient privileges.")
}

#[catch(404)]
fn not_found(req: &Request) -> Problem {
    problems::not_found("Resource")
        .instance_uri(req.uri().to_string())
        .to_owned()
}

#[catch(413)]
fn payload_too_large(_: &Request) -> Problem {
    Problem::new_untyped(Status::PayloadTooLarge, "Uploaded payload is too large.")
}

#[catch(500)]
fn internal(_: &Request) -> Problem {
    Problem::new_untyped(Status::InternalServerError, "Internal Server Error")
}

pub fn catchers() -> Vec<Catcher> {
    catchers![
        bad_request,
        unprocessable,
        unauthorized,
        forbidden,
        not_found,
        payload_too_large,
        internal
    ]
}
