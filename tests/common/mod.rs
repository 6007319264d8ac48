#![allow(dead_code)]

use kanp::anp::kanp::{KANP_KCD_ROLE_FILE_XFER, KANP_KCD_ROLE_WORKSPACE};
use kanp::kfs::{FileRequest, Operation, PhaseOneReply, Ticket};
use kanp::server::{Kcd, ShareKey};
use kanp::{ClientConfig, KcdClient, ServerConfig};
use tokio::io::DuplexStream;

pub const SHARE: ShareKey = (42, 1);

pub type Client = KcdClient<DuplexStream>;

/// A reference KCD plus one workspace-role connection for tickets.
pub struct Harness {
    pub kcd: Kcd,
    workspace: Client,
}

impl Harness {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_server_config(ServerConfig::default()).await
    }

    pub async fn with_server_config(config: ServerConfig) -> anyhow::Result<Self> {
        let kcd = Kcd::new(config);
        let mut workspace = connect(&kcd, ClientConfig::default())?;
        workspace.select_role(KANP_KCD_ROLE_WORKSPACE).await?;
        Ok(Self { kcd, workspace })
    }

    pub async fn upload_ticket(&mut self) -> anyhow::Result<Ticket> {
        Ok(self.workspace.request_upload_ticket(SHARE.0, SHARE.1).await?)
    }

    pub async fn download_ticket(&mut self) -> anyhow::Result<Ticket> {
        Ok(self
            .workspace
            .request_download_ticket(SHARE.0, SHARE.1)
            .await?)
    }

    /// New file-transfer connection.
    pub async fn xfer(&self) -> anyhow::Result<Client> {
        self.xfer_with(ClientConfig::default()).await
    }

    pub async fn xfer_with(&self, config: ClientConfig) -> anyhow::Result<Client> {
        let mut client = connect(&self.kcd, config)?;
        client.select_role(KANP_KCD_ROLE_FILE_XFER).await?;
        Ok(client)
    }

    /// Run one phase-one batch on a fresh ticket.
    pub async fn batch(
        &mut self,
        client: &mut Client,
        operations: &[Operation],
    ) -> anyhow::Result<PhaseOneReply> {
        let ticket = self.upload_ticket().await?;
        Ok(client.submit_batch(&ticket, 0, operations).await?)
    }

    /// Create files at the root and upload their content.
    pub async fn create_files(
        &mut self,
        client: &mut Client,
        files: &[(&str, &[u8])],
    ) -> anyhow::Result<(Vec<u64>, u64)> {
        let root_commit = self.kcd.store().inode(SHARE, 0).await.map(|n| n.commit_id);
        let root_commit = root_commit.unwrap_or(0);
        let ops: Vec<Operation> = files
            .iter()
            .map(|(name, _)| Operation::CreateFile {
                parent_id: 0,
                parent_commit_id: root_commit,
                name: name.to_string(),
            })
            .collect();
        let reply = self.batch(client, &ops).await?;
        assert!(reply.all_ok(), "{:?}", reply);

        let mut upload = client.open_upload(reply.pending_uploads(&ops));
        for (_, content) in files {
            let mut session = upload.next_file()?;
            session.write_chunk(content).await?;
            session.commit().await?;
        }

        let mut ids = Vec::new();
        for (name, _) in files {
            ids.push(self.find(0, name).await.expect("created file"));
        }
        Ok((ids, reply.commit_id))
    }

    /// Inode id of a live child, looked up on the server side.
    pub async fn find(&self, parent: u64, name: &str) -> Option<u64> {
        for id in 1..1000 {
            match self.kcd.store().inode(SHARE, id).await {
                Some(n) if n.parent_id == parent && n.name == name && n.is_live() => {
                    return Some(id)
                }
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }

    pub async fn download(
        &mut self,
        client: &mut Client,
        files: &[FileRequest],
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let ticket = self.download_ticket().await?;
        let stream = client.open_download(&ticket, files).await?;
        Ok(stream.collect_files().await?)
    }
}

/// Connect a client to a fresh session of `kcd` over an in-memory pipe.
pub fn connect(kcd: &Kcd, config: ClientConfig) -> anyhow::Result<Client> {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let kcd = kcd.clone();
    tokio::spawn(async move {
        let _ = kcd.serve(server_end).await;
    });
    Ok(KcdClient::with_config(client_end, config)?)
}
