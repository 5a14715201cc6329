use serde::Deserialize;

use crate::{
    config::{Config, ConfigError, PersistedConfig, WifiCredentials},
    network::PortalOutcome,
};

pub const PORTAL_CONFIG_PATH: &str = "/api/config";

/// Paths operating systems probe to detect a captive portal.
pub const CAPTIVE_PROBE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>SimpleWeather Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .row{display:flex;gap:1rem}.row>div{flex:1}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>SimpleWeather Setup</h1>
  <p class="muted">Configure the broker and topics for this sensor. Values are limited to 40 characters.</p>

  <div class="card">
    <h2>WiFi</h2>
    <label>SSID (may be left blank only if the sensor already knows a network)</label><input id="wifiSsid" type="text" maxlength="32">
    <label>Password</label><input id="wifiPass" type="password" maxlength="64">
  </div>

  <div class="card">
    <h2>MQTT</h2>
    <label>Device name</label><input id="hostName" type="text" maxlength="40">
    <div class="row">
      <div><label>MQTT server</label><input id="mqtt_server" type="text" maxlength="40"></div>
      <div><label>MQTT port</label><input id="mqtt_port" type="number" min="1" max="65535"></div>
    </div>
    <label>Temperature topic</label><input id="temperatureTopic" type="text" maxlength="40">
    <label>Humidity topic</label><input id="humidityTopic" type="text" maxlength="40">
    <label>Status topic</label><input id="statusTopic" type="text" maxlength="40">
    <button id="save">Save and connect</button>
  </div>

  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);
    const fields=['hostName','mqtt_server','mqtt_port','temperatureTopic','humidityTopic','statusTopic'];

    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }

    async function load(){
      const c=await api('/api/config');
      fields.forEach((f)=>{q(f).value=c[f]||'';});
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={};
        fields.forEach((f)=>{payload[f]=q(f).value.trim();});
        const ssid=q('wifiSsid').value.trim();
        if(ssid){payload.wifiSsid=ssid;payload.wifiPass=q('wifiPass').value;}
        await api('/api/config',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent='Saved. The sensor is connecting now.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    load().catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;

/// Body of `PUT /api/config`: the stored config keys plus optional WiFi
/// credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalSubmission {
    #[serde(flatten)]
    pub config: PersistedConfig,
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: Option<String>,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
}

impl PortalSubmission {
    /// `ssid_required` is set when the link has no station credentials of its
    /// own, so a blank SSID would leave nothing to join.
    pub fn into_outcome(self, ssid_required: bool) -> Result<PortalOutcome, ConfigError> {
        let config = Config::try_from(self.config)?;
        let credentials = self
            .wifi_ssid
            .map(|ssid| ssid.trim().to_string())
            .filter(|ssid| !ssid.is_empty())
            .map(|ssid| WifiCredentials {
                ssid,
                password: self.wifi_pass.unwrap_or_default(),
            });
        if ssid_required && credentials.is_none() {
            return Err(ConfigError::Empty { field: "wifiSsid" });
        }

        Ok(PortalOutcome {
            config,
            credentials,
        })
    }
}

pub fn parse_submission(body: &[u8], ssid_required: bool) -> Result<PortalOutcome, String> {
    let submission: PortalSubmission =
        serde_json::from_slice(body).map_err(|err| format!("invalid config payload: {err}"))?;
    submission
        .into_outcome(ssid_required)
        .map_err(|err| err.to_string())
}
