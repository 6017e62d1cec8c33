use std::path::PathBuf;

use rocket::fs::NamedFile;
use rocket::State;

use crate::config::Config;

/// Files kept by the local media store. `..` segments never match.
#[get("/media/<path..>")]
pub async fn media_file(path: PathBuf, c: &State<Config>) -> Option<NamedFile> {
    NamedFile::open(c.media_dir.as_path().join(path.as_path()))
        .await
        .ok()
}

#[cfg(test)]
mod file_endpoints {
    use rocket::http::Status;

    use crate::config::Config;
    use crate::route::testing::client;

    #[rocket::async_test]
    async fn stored_media_is_served() {
        let client = client().await;
        let media_dir = Config::for_tests().media_dir.join("documents");
        std::fs::create_dir_all(&media_dir).unwrap();
        std::fs::write(media_dir.join("served-file.txt"), "hello").unwrap();

        let response = client.get("/media/documents/served-file.txt").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.as_deref(), Some("hello"));

        let missing = client.get("/media/documents/absent.txt").dispatch().await;
        assert_eq!(missing.status(), Status::NotFound);
    }
}
