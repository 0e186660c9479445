use std::time::Duration;

use portal_process::{ServerState, ServerStatus, SessionId};
use tokio::sync::Mutex;

use crate::{
    download::{DownloadReport, Downloader},
    error::Result,
    extract::{ExtractReport, extract_latest_image},
    progress::ProgressSink,
    properties::ServerProperties,
    settings::Settings,
    supervisor::{OutputSubscription, ServerSupervisor, SupervisorConfig},
};

/// Everything a caller needs to run one server: fetch a package, unpack it,
/// run the process and edit its properties.
#[derive(Debug)]
pub struct ServerManager {
    settings: Settings,
    downloader: Downloader,
    supervisor: ServerSupervisor,
    // Download and extract both rewrite on-disk state; never run them together.
    ops_lock: Mutex<()>,
}

impl ServerManager {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let downloader = Downloader::new(
            settings.endpoint.clone(),
            settings.download_type.clone(),
            settings.images_dir.clone(),
        );
        let supervisor = ServerSupervisor::new(SupervisorConfig::from_settings(&settings));
        Ok(Self {
            settings,
            downloader,
            supervisor,
            ops_lock: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn resolve_download_url(&self) -> Result<String> {
        self.downloader
            .resolve_download_url(&self.settings.download_type)
            .await
    }

    pub async fn download(&self, progress: &dyn ProgressSink) -> Result<DownloadReport> {
        let _guard = self.ops_lock.lock().await;
        self.downloader.download(progress).await
    }

    /// Replaces the server directory with the newest downloaded image. Does
    /// not check whether the server is running.
    pub async fn extract(&self, progress: &dyn ProgressSink) -> Result<ExtractReport> {
        let _guard = self.ops_lock.lock().await;
        if self.supervisor.state().is_running() {
            tracing::warn!("extracting while the server is running");
        }
        extract_latest_image(
            &self.settings.images_dir,
            &self.settings.server_dir,
            Some(&self.settings.executable_name),
            progress,
        )
        .await
    }

    pub async fn start(&self) -> Result<SessionId> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    pub async fn stop_and_wait(&self, grace: Duration) -> Result<bool> {
        self.supervisor.stop_and_wait(grace).await
    }

    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        self.supervisor.wait_for_exit(timeout).await
    }

    pub async fn send_command(&self, command: &str) -> Result<()> {
        self.supervisor.send_command(command).await
    }

    pub fn subscribe(&self) -> OutputSubscription {
        self.supervisor.subscribe()
    }

    pub fn output(&self) -> String {
        self.supervisor.output()
    }

    pub fn state(&self) -> ServerState {
        self.supervisor.state()
    }

    pub async fn status(&self) -> ServerStatus {
        self.supervisor.status().await
    }

    /// Opens a fresh edit session on `server.properties`.
    pub fn edit_properties(&self) -> Result<ServerProperties> {
        ServerProperties::load(self.settings.properties_path())
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortalError;
    use std::{io::Write, path::Path};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn settings_in(root: &Path, endpoint: &str) -> Settings {
        Settings {
            endpoint: endpoint.to_string(),
            download_type: "serverBedrockLinux".to_string(),
            images_dir: root.join("images"),
            server_dir: root.join("server"),
            executable_name: "bedrock_server".to_string(),
            loader_path_var: None,
            output_limit_bytes: 0,
        }
    }

    fn server_zip() -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts = zip::write::SimpleFileOptions::default();
        zip.start_file("bedrock_server", opts).unwrap();
        zip.write_all(b"#!/bin/sh\nread line\necho \"got $line\"\n").unwrap();
        zip.start_file("server.properties", opts).unwrap();
        zip.write_all(b"# generated\nlevel-name=Bedrock level\ndifficulty=easy\n")
            .unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerManager::new(settings_in(dir.path(), "ftp://nope")).unwrap_err();
        assert!(matches!(err, PortalError::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn download_extract_and_edit_properties() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/links"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "links": [
                    { "downloadType": "serverBedrockLinux",
                      "downloadUrl": format!("{}/bin/bedrock-server-1.21.0.zip", server.uri()) }
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bin/bedrock-server-1.21.0.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(server_zip()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager =
            ServerManager::new(settings_in(dir.path(), &format!("{}/links", server.uri())))
                .unwrap();

        assert!(
            manager
                .resolve_download_url()
                .await
                .unwrap()
                .ends_with("bedrock-server-1.21.0.zip")
        );
        let report = manager.download(&()).await.unwrap();
        assert!(report.path.ends_with("bedrock-server-1.21.0.zip"));

        let report = manager.extract(&()).await.unwrap();
        assert_eq!(report.entries, 2);

        let mut props = manager.edit_properties().unwrap();
        assert_eq!(props.get("level-name"), Some("Bedrock level"));
        props.set("level-name", "world2");
        props.save().unwrap();
        assert_eq!(
            manager.edit_properties().unwrap().get("level-name"),
            Some("world2")
        );
    }

    #[tokio::test]
    async fn edit_properties_without_install_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerManager::new(settings_in(dir.path(), "http://127.0.0.1:1/")).unwrap();
        let err = manager.edit_properties().unwrap_err();
        assert!(matches!(err, PortalError::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn concurrent_download_and_extract_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServerManager::new(settings_in(dir.path(), "http://127.0.0.1:1/")).unwrap();
        std::fs::create_dir_all(dir.path().join("server")).unwrap();
        std::fs::write(dir.path().join("server").join("keep.txt"), b"x").unwrap();

        let (download, extract) = tokio::join!(manager.download(&()), manager.extract(&()));

        assert!(matches!(download, Err(PortalError::Download(_))));
        assert!(matches!(extract, Err(PortalError::Extraction(_))));
        assert!(dir.path().join("server").join("keep.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_the_extracted_server() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images").join("server.zip"), server_zip()).unwrap();
        let manager = ServerManager::new(settings_in(dir.path(), "http://127.0.0.1:1/")).unwrap();
        let mut events = manager.subscribe();

        manager.extract(&()).await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.state(), ServerState::Running);
        manager.send_command("list").await.unwrap();
        assert!(manager.wait_for_exit(Duration::from_secs(10)).await);

        let mut lines = Vec::new();
        while let Some(ev) = events.try_recv() {
            lines.push(ev.line);
        }
        assert!(lines.iter().any(|l| l == "got list"), "{lines:?}");
        assert_eq!(manager.status().await.exit_code, Some(0));
        manager.shutdown().await;
    }
}
