//! Direct power control through a node's BMC.
//!
//! The power-off command's own exit status proves nothing: only a later
//! status read that reports the chassis off confirms the fence.

use std::time::Duration;

use secrecy::SecretString;
use tracing::{debug, error, info, warn};

use super::{FailureReason, FenceOutcome};
use crate::config::DirectPowerConfig;
use crate::credentials::{CredentialConfig, Credentials};
use crate::exec::{CommandError, CommandRunner, CommandSpec};
use crate::interrupt::InterruptFlag;

/// Environment variable ipmitool reads its password from with `-E`.
const IPMI_PASSWORD_ENV: &str = "IPMI_PASSWORD";

/// BMC power operations.
pub trait BmcClient: Send + Sync {
    /// Requests chassis power off.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run or reports failure.
    fn power_off(&self, bmc: &str, credentials: Option<&Credentials>) -> Result<(), CommandError>;

    /// Reads the chassis power status report.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run or reports failure.
    fn power_status(
        &self,
        bmc: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, CommandError>;
}

/// [`BmcClient`] running `ipmitool`.
#[derive(Debug, Clone)]
pub struct IpmitoolClient<R> {
    runner: R,
    program: String,
    interface: String,
    timeout: Duration,
}

impl<R: CommandRunner> IpmitoolClient<R> {
    /// Creates a client from the direct-power configuration.
    #[must_use]
    pub fn new(runner: R, config: &DirectPowerConfig) -> Self {
        Self {
            runner,
            program: config.ipmitool_program.clone(),
            interface: config.interface.clone(),
            timeout: config.command_timeout,
        }
    }

    fn chassis_power(
        &self,
        bmc: &str,
        credentials: Option<&Credentials>,
        action: &str,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program, self.timeout)
            .arg("-I")
            .arg(&self.interface)
            .arg("-H")
            .arg(bmc);
        if let Some(creds) = credentials {
            spec = spec
                .arg("-U")
                .arg(&creds.username)
                .arg("-E")
                .secret_env(IPMI_PASSWORD_ENV, SecretString::clone(&creds.password));
        }
        spec.args(["chassis", "power", action])
    }

    fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        let output = self.runner.run(spec)?.into_success(&self.program)?;
        Ok(output.stdout.trim().to_string())
    }
}

impl<R: CommandRunner> BmcClient for IpmitoolClient<R> {
    fn power_off(&self, bmc: &str, credentials: Option<&Credentials>) -> Result<(), CommandError> {
        self.run(&self.chassis_power(bmc, credentials, "off"))
            .map(|_| ())
    }

    fn power_status(
        &self,
        bmc: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, CommandError> {
        self.run(&self.chassis_power(bmc, credentials, "status"))
    }
}

/// True when a status report says the chassis is off.
///
/// Containment rather than equality: BMCs word the report differently
/// ("Chassis Power is off", "Power: off") and the loose match is kept until
/// the hardware inventory says otherwise.
#[must_use]
pub fn status_reads_off(report: &str) -> bool {
    report.contains("off")
}

/// Status polling budget after the power-off command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolling {
    /// Number of status reads.
    pub retries: u32,
    /// Sleep before each read.
    pub wait: Duration,
}

impl From<&DirectPowerConfig> for StatusPolling {
    fn from(config: &DirectPowerConfig) -> Self {
        Self {
            retries: config.status_retries,
            wait: config.status_wait,
        }
    }
}

/// Direct power control driver.
pub struct DirectPowerDriver<B> {
    client: B,
    credentials: CredentialConfig,
    polling: StatusPolling,
    interrupt: InterruptFlag,
}

impl<B: BmcClient> DirectPowerDriver<B> {
    /// Creates a driver.
    #[must_use]
    pub fn new(client: B, config: &DirectPowerConfig, interrupt: InterruptFlag) -> Self {
        Self {
            client,
            credentials: config.credentials.clone(),
            polling: StatusPolling::from(config),
            interrupt,
        }
    }

    /// Decodes the BMC credentials, if any are configured.
    fn credentials(&self) -> Result<Option<Credentials>, FailureReason> {
        if self.credentials.is_empty() {
            return Ok(None);
        }
        self.credentials
            .decode()
            .map(Some)
            .map_err(|e| FailureReason::BadCredentials(e.to_string()))
    }

    /// Validates credentials without contacting the BMC.
    ///
    /// # Errors
    ///
    /// Returns [`FailureReason::BadCredentials`] when they do not decode.
    pub fn preflight(&self) -> Result<(), FailureReason> {
        self.credentials().map(|_| ())
    }

    /// Powers off through `bmc` and polls until the status reads off.
    pub fn power_off_and_confirm(&self, bmc: &str) -> FenceOutcome {
        let credentials = match self.credentials() {
            Ok(credentials) => credentials,
            Err(reason) => return FenceOutcome::Failed(reason),
        };

        info!(bmc, "ipmi power off");
        if let Err(e) = self.client.power_off(bmc, credentials.as_ref()) {
            error!(bmc, error = %e, "ipmi off {bmc} failed");
            return FenceOutcome::Failed(FailureReason::CommandError(format!(
                "ipmi off {bmc}: {e}"
            )));
        }

        for attempt in 1..=self.polling.retries {
            if self.interrupt.is_raised() {
                warn!(bmc, attempt, "interrupted while polling power status");
                return FenceOutcome::Failed(FailureReason::Interrupted);
            }
            std::thread::sleep(self.polling.wait);

            match self.client.power_status(bmc, credentials.as_ref()) {
                Ok(report) if status_reads_off(&report) => {
                    info!(bmc, attempt, %report, "ipmi power confirmed off");
                    return FenceOutcome::Confirmed;
                },
                Ok(report) => debug!(bmc, attempt, %report, "ipmi power not off yet"),
                Err(e) => warn!(bmc, attempt, error = %e, "ipmi status read failed"),
            }
        }

        let reason = format!("ipmi stat {bmc} not off");
        error!(bmc, retries = self.polling.retries, "{reason}");
        FenceOutcome::Failed(FailureReason::NotConfirmedOff(reason))
    }

    /// Reads the power status without changing it.
    ///
    /// # Errors
    ///
    /// Returns a description of why the read failed.
    pub fn check_status(&self, bmc: &str) -> Result<String, String> {
        let credentials = self.credentials().map_err(|r| r.to_string())?;
        self.client
            .power_status(bmc, credentials.as_ref())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::exec::CommandOutput;

    /// BMC fake replaying scripted status reports.
    struct FakeBmc {
        off_result: Result<(), String>,
        statuses: Mutex<VecDeque<Result<String, String>>>,
        off_calls: Mutex<u32>,
        status_calls: Mutex<u32>,
    }

    impl FakeBmc {
        fn new(off_result: Result<(), String>, statuses: &[Result<&str, &str>]) -> Self {
            Self {
                off_result,
                statuses: Mutex::new(
                    statuses
                        .iter()
                        .map(|s| s.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                off_calls: Mutex::new(0),
                status_calls: Mutex::new(0),
            }
        }
    }

    fn failed(program: &str, why: String) -> CommandError {
        CommandError::Failed {
            program: program.to_string(),
            code: Some(1),
            stderr: why,
        }
    }

    impl BmcClient for FakeBmc {
        fn power_off(&self, _bmc: &str, _c: Option<&Credentials>) -> Result<(), CommandError> {
            *self.off_calls.lock().unwrap() += 1;
            self.off_result.clone().map_err(|e| failed("ipmitool", e))
        }

        fn power_status(
            &self,
            _bmc: &str,
            _c: Option<&Credentials>,
        ) -> Result<String, CommandError> {
            *self.status_calls.lock().unwrap() += 1;
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("Chassis Power is on".to_string()))
                .map_err(|e| failed("ipmitool", e))
        }
    }

    fn config(retries: u32) -> DirectPowerConfig {
        DirectPowerConfig {
            status_retries: retries,
            status_wait: Duration::ZERO,
            ..DirectPowerConfig::default()
        }
    }

    #[test]
    fn confirms_after_status_reads_off() {
        let bmc = FakeBmc::new(
            Ok(()),
            &[
                Ok("Chassis Power is on"),
                Err("timeout"),
                Ok("Chassis Power is off"),
            ],
        );
        let driver = DirectPowerDriver::new(bmc, &config(5), InterruptFlag::new());
        assert_eq!(driver.power_off_and_confirm("10.0.1.101"), FenceOutcome::Confirmed);
        assert_eq!(*driver.client.status_calls.lock().unwrap(), 3);
    }

    #[test]
    fn successful_off_command_alone_is_not_confirmation() {
        let bmc = FakeBmc::new(Ok(()), &[]);
        let driver = DirectPowerDriver::new(bmc, &config(3), InterruptFlag::new());
        assert_eq!(
            driver.power_off_and_confirm("10.0.1.103"),
            FenceOutcome::Failed(FailureReason::NotConfirmedOff(
                "ipmi stat 10.0.1.103 not off".to_string()
            ))
        );
        assert_eq!(*driver.client.status_calls.lock().unwrap(), 3);
    }

    #[test]
    fn failing_off_command_skips_polling() {
        let bmc = FakeBmc::new(Err("Unable to establish session".to_string()), &[]);
        let driver = DirectPowerDriver::new(bmc, &config(3), InterruptFlag::new());
        let outcome = driver.power_off_and_confirm("10.0.1.1");
        assert!(
            matches!(outcome, FenceOutcome::Failed(FailureReason::CommandError(_))),
            "{outcome}"
        );
        assert_eq!(*driver.client.status_calls.lock().unwrap(), 0);
    }

    #[test]
    fn interrupt_stops_polling() {
        let interrupt = InterruptFlag::new();
        interrupt.raise();
        let driver = DirectPowerDriver::new(FakeBmc::new(Ok(()), &[]), &config(3), interrupt);
        assert_eq!(
            driver.power_off_and_confirm("b"),
            FenceOutcome::Failed(FailureReason::Interrupted)
        );
        assert_eq!(*driver.client.off_calls.lock().unwrap(), 1);
        assert_eq!(*driver.client.status_calls.lock().unwrap(), 0);
    }

    #[test]
    fn bad_credentials_fail_before_any_command() {
        let mut cfg = config(3);
        cfg.credentials = CredentialConfig {
            username: "ADMIN".to_string(),
            password: None,
            password_base64: Some(SecretString::from("%%%".to_string())),
        };
        let driver = DirectPowerDriver::new(FakeBmc::new(Ok(()), &[]), &cfg, InterruptFlag::new());
        assert!(matches!(
            driver.preflight(),
            Err(FailureReason::BadCredentials(_))
        ));
        assert!(matches!(
            driver.power_off_and_confirm("b"),
            FenceOutcome::Failed(FailureReason::BadCredentials(_))
        ));
        assert_eq!(*driver.client.off_calls.lock().unwrap(), 0);
    }

    #[test]
    fn loose_off_matching() {
        assert!(status_reads_off("Chassis Power is off"));
        assert!(!status_reads_off("Chassis Power is on"));
        assert!(!status_reads_off(""));
    }

    struct RecordingRunner(Mutex<Vec<(Vec<String>, Vec<(String, String)>)>>);

    impl CommandRunner for RecordingRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            let env = spec
                .secret_env
                .iter()
                .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
                .collect();
            self.0.lock().unwrap().push((spec.args.clone(), env));
            Ok(CommandOutput {
                code: Some(0),
                stdout: "Chassis Power is off\n".to_string(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn ipmitool_keeps_password_out_of_argv() {
        let client = IpmitoolClient::new(
            RecordingRunner(Mutex::new(Vec::new())),
            &DirectPowerConfig::default(),
        );
        let creds = Credentials {
            username: "ADMIN".to_string(),
            password: SecretString::from("pw".to_string()),
        };
        let status = client.power_status("10.0.1.5", Some(&creds)).unwrap();
        assert_eq!(status, "Chassis Power is off");

        let calls = client.runner.0.lock().unwrap();
        let (args, env) = &calls[0];
        assert_eq!(
            args,
            &[
                "-I", "lanplus", "-H", "10.0.1.5", "-U", "ADMIN", "-E", "chassis", "power",
                "status"
            ]
        );
        assert!(!args.iter().any(|a| a == "pw"));
        assert_eq!(env, &[(IPMI_PASSWORD_ENV.to_string(), "pw".to_string())]);
    }
}
