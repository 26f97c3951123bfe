//! 文件存储 - `members.json`（按 session 名称 upsert）与 `deliveries.jsonl`（追加）
//!
//! 写操作都在文件锁保护下进行，多个进程同时写也不会丢记录。
//! 阻塞 I/O 在 `spawn_blocking` 中执行。

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DeliveryLogEntry, MemberEdit, MemberRecord, StateStore};

type MembersFile = BTreeMap<String, MemberRecord>;

/// JSON 文件存储
#[derive(Clone)]
pub struct JsonFileStore {
    paths: Arc<StorePaths>,
}

struct StorePaths {
    members: PathBuf,
    members_lock: PathBuf,
    deliveries: PathBuf,
}

impl JsonFileStore {
    /// 在 `data_dir` 下创建存储（目录不存在时自动创建）
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("创建数据目录失败: {}", data_dir.display()))?;
        Ok(Self {
            paths: Arc::new(StorePaths {
                members: data_dir.join("members.json"),
                members_lock: data_dir.join("members.json.lock"),
                deliveries: data_dir.join("deliveries.jsonl"),
            }),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StorePaths) -> Result<T> + Send + 'static,
    {
        let paths = Arc::clone(&self.paths);
        tokio::task::spawn_blocking(move || op(paths.as_ref()))
            .await
            .context("store task panicked")?
    }
}

impl StorePaths {
    fn read_members_internal(&self) -> Result<MembersFile> {
        if !self.members.exists() {
            return Ok(MembersFile::new());
        }
        let content = fs::read_to_string(&self.members)?;
        if content.trim().is_empty() {
            return Ok(MembersFile::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// 先写临时文件再原子替换
    fn write_members_internal(&self, file: &MembersFile) -> Result<()> {
        let temp = self.members.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_string_pretty(file)?)?;
        fs::rename(&temp, &self.members)?;
        Ok(())
    }

    fn open_lock(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.members_lock)?)
    }

    /// 在排他锁下执行读-改-写
    fn with_locked_members<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut MembersFile) -> Result<T>,
    {
        let lock_file = self.open_lock()?;
        lock_file.lock_exclusive()?;

        let result = (|| {
            let mut file = self.read_members_internal()?;
            let result = operation(&mut file)?;
            self.write_members_internal(&file)?;
            Ok(result)
        })();

        let _ = lock_file.unlock();
        result
    }

    /// 在共享锁下只读
    fn with_locked_members_read<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&MembersFile) -> Result<T>,
    {
        let lock_file = self.open_lock()?;
        lock_file.lock_shared()?;

        let result = (|| {
            let file = self.read_members_internal()?;
            operation(&file)
        })();

        let _ = lock_file.unlock();
        result
    }

    fn append_delivery(&self, entry: &DeliveryLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.deliveries)?;

        file.lock_exclusive()?;
        let mut file = file;
        let written = writeln!(file, "{}", serde_json::to_string(entry)?);
        let _ = file.unlock();
        written?;
        Ok(())
    }

    fn read_deliveries(&self) -> Result<Vec<DeliveryLogEntry>> {
        if !self.deliveries.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.deliveries)?;
        file.lock_shared()?;
        // 损坏的行直接跳过
        let entries = BufReader::new(&file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        let _ = file.unlock();
        Ok(entries)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get_member(&self, session_name: &str) -> Result<Option<MemberRecord>> {
        let key = session_name.to_string();
        self.blocking(move |p| p.with_locked_members_read(|file| Ok(file.get(&key).cloned())))
            .await
    }

    async fn put_member(&self, record: MemberRecord) -> Result<()> {
        self.blocking(move |p| {
            p.with_locked_members(|file| {
                file.insert(record.session_name.clone(), record);
                Ok(())
            })
        })
        .await
    }

    /// 读和写在同一把排他锁内，其他进程的写入不会夹在中间
    async fn update_member(
        &self,
        session_name: &str,
        create_role: Option<&str>,
        edit: MemberEdit,
    ) -> Result<Option<MemberRecord>> {
        let key = session_name.to_string();
        let role = create_role.map(|r| r.to_string());
        self.blocking(move |p| {
            p.with_locked_members(|file| {
                if !file.contains_key(&key) {
                    let Some(role) = role else {
                        return Ok(None);
                    };
                    file.insert(key.clone(), MemberRecord::new(&key, &role));
                }
                Ok(file.get_mut(&key).map(|record| {
                    edit(record);
                    record.clone()
                }))
            })
        })
        .await
    }

    async fn remove_member(&self, session_name: &str) -> Result<()> {
        let key = session_name.to_string();
        self.blocking(move |p| {
            p.with_locked_members(|file| {
                file.remove(&key);
                Ok(())
            })
        })
        .await
    }

    async fn get_all_members(&self) -> Result<Vec<MemberRecord>> {
        self.blocking(|p| p.with_locked_members_read(|file| Ok(file.values().cloned().collect())))
            .await
    }

    async fn record_delivery_log(&self, entry: DeliveryLogEntry) -> Result<()> {
        self.blocking(move |p| p.append_delivery(&entry)).await
    }

    async fn delivery_logs(&self, session_name: Option<&str>) -> Result<Vec<DeliveryLogEntry>> {
        let filter = session_name.map(|s| s.to_string());
        self.blocking(move |p| {
            let mut entries = p.read_deliveries()?;
            if let Some(session) = filter {
                entries.retain(|e| e.target_session == session);
            }
            Ok(entries)
        })
        .await
    }
}
